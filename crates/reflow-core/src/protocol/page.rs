//! Page descriptors.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::forward::AppPage;
use crate::PageHash;

/// A page of a multipage app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub page_script_hash: PageHash,
    pub page_name: String,
    #[serde(default)]
    pub icon: String,
    pub script_path: PathBuf,
    /// URL segment addressing the page; empty for the main page.
    #[serde(default)]
    pub url_pathname: String,
}

impl PageInfo {
    /// Client-facing view of this page.
    ///
    /// Underscores in the page name are shown as spaces.
    #[must_use]
    pub fn to_app_page(&self, is_default: bool) -> AppPage {
        AppPage {
            page_script_hash: self.page_script_hash.clone(),
            page_name: self.page_name.replace('_', " "),
            icon: self.icon.clone(),
            url_pathname: self.url_pathname.clone(),
            is_default,
        }
    }
}
