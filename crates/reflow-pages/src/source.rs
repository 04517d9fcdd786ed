//! Page discovery for the `pages/` directory convention.

use std::{
    cmp::Ordering,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use regex::Regex;
use reflow_core::{PageHash, PageInfo};
use sha2::{Digest, Sha256};

use crate::PagesError;

/// Name of the directory holding page scripts, next to the main script.
pub const PAGES_DIR_NAME: &str = "pages";

fn page_filename_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([0-9]*)[_ -]*(.*)\.[^.]+$").expect("page filename regex"))
}

fn page_icon_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([\x{10000}-\x{10FFFF}\x{2600}-\x{26FF}\x{2700}-\x{27BF}\x{200D}\x{FE0F}]+)[_ -]*(.*)$")
            .expect("page icon regex")
    })
}

fn whitespace_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[_ ]+").expect("separator regex"))
}

/// Content-addressed id of a page script: hex SHA-256 of its path.
#[must_use]
pub fn calc_page_hash(script_path: &Path) -> PageHash {
    let mut hasher = Sha256::new();
    hasher.update(script_path.to_string_lossy().as_bytes());
    hex::encode(hasher.finalize())
}

/// Split a page file name into `(icon, name)`.
///
/// A leading number is dropped, runs of underscores and spaces collapse to
/// one underscore, and a leading emoji becomes the icon. A file name that
/// is only a number keeps the number as its name.
#[must_use]
pub fn page_icon_and_name(script_path: &Path) -> (String, String) {
    let Some(file_name) = script_path.file_name().map(|n| n.to_string_lossy()) else {
        return (String::new(), String::new());
    };
    let Some(caps) = page_filename_regex().captures(&file_name) else {
        return (String::new(), String::new());
    };

    let number = caps.get(1).map_or("", |m| m.as_str());
    let rest = caps.get(2).map_or("", |m| m.as_str());
    let collapsed = whitespace_regex().replace_all(rest, "_");
    let icon_and_name = match collapsed.trim() {
        "" => number,
        trimmed => trimmed,
    };

    extract_leading_emoji(icon_and_name)
}

fn extract_leading_emoji(text: &str) -> (String, String) {
    page_icon_regex().captures(text).map_or_else(
        || (String::new(), text.to_string()),
        |caps| {
            let icon = caps.get(1).map_or("", |m| m.as_str());
            let name = caps.get(2).map_or("", |m| m.as_str());
            (icon.to_string(), name.to_string())
        },
    )
}

/// Ordering key of a page file: its leading number (unnumbered pages sort
/// last), then its lowercased label.
#[must_use]
pub fn page_sort_key(script_path: &Path) -> (f64, String) {
    let file_name = script_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    page_filename_regex().captures(&file_name).map_or_else(
        || (f64::INFINITY, file_name.to_lowercase()),
        |caps| {
            let number = caps.get(1).map_or("", |m| m.as_str());
            let label = caps.get(2).map_or("", |m| m.as_str()).to_lowercase();
            let number = number.parse::<f64>().unwrap_or(f64::INFINITY);
            (number, label)
        },
    )
}

fn compare_pages(a: &Path, b: &Path) -> Ordering {
    let (a_num, a_label) = page_sort_key(a);
    let (b_num, b_label) = page_sort_key(b);
    a_num.total_cmp(&b_num).then_with(|| a_label.cmp(&b_label))
}

/// Build the page entry for a script.
#[must_use]
pub fn page_info_for(script_path: &Path, url_pathname: Option<String>) -> PageInfo {
    let (icon, page_name) = page_icon_and_name(script_path);
    PageInfo {
        page_script_hash: calc_page_hash(script_path),
        url_pathname: url_pathname.unwrap_or_else(|| page_name.clone()),
        page_name,
        icon,
        script_path: script_path.to_path_buf(),
    }
}

/// Discover the main page plus every page script under `pages/`.
///
/// The main page comes first. Page scripts must share the main script's
/// extension; dotfiles and `__init__` files are skipped.
///
/// # Errors
/// Returns error if the pages directory exists but cannot be listed.
pub fn discover_pages(main_script_path: &Path) -> Result<Vec<PageInfo>, PagesError> {
    let mut pages = vec![page_info_for(main_script_path, Some(String::new()))];

    let pages_dir = pages_dir_for(main_script_path);
    if !pages_dir.is_dir() {
        return Ok(pages);
    }

    let extension = main_script_path.extension();
    let entries = std::fs::read_dir(&pages_dir).map_err(|source| PagesError::Io {
        path: pages_dir.clone(),
        source,
    })?;

    let mut scripts: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_page_script(path, extension))
        .collect();
    scripts.sort_by(|a, b| compare_pages(a, b));

    pages.extend(scripts.iter().map(|path| page_info_for(path, None)));
    Ok(pages)
}

/// The `pages/` directory for a main script.
#[must_use]
pub fn pages_dir_for(main_script_path: &Path) -> PathBuf {
    main_script_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(PAGES_DIR_NAME)
}

fn is_page_script(path: &Path, extension: Option<&std::ffi::OsStr>) -> bool {
    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if file_name.starts_with('.') {
        return false;
    }
    if path.file_stem().and_then(|s| s.to_str()) == Some("__init__") {
        return false;
    }
    path.extension() == extension
}
