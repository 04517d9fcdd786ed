//! Forward messages the session builds itself.

use reflow_core::{
    ForwardMsg, PageInfo,
    config::ThemeConfig,
    protocol::{
        AppPage, ForwardMsgKind, Initialize, NewSession, NewSessionConfig,
        SessionStatus,
    },
};
use tracing::warn;
use uuid::Uuid;

use super::{AppSession, AppSessionState};

const THEME_BASES: [&str; 2] = ["light", "dark"];

impl AppSession {
    pub(crate) fn create_new_session_message(
        &self,
        page_script_hash: &str,
        fragment_ids_this_run: Vec<String>,
    ) -> ForwardMsg {
        let config = &self.services.config;
        let new_session = NewSession {
            script_run_id: Uuid::new_v4().to_string(),
            name: script_name(&self.main_script_path),
            main_script_path: self.main_script_path.display().to_string(),
            main_script_hash: self.pages_manager.main_script_hash().to_string(),
            page_script_hash: page_script_hash.to_string(),
            fragment_ids_this_run,
            app_pages: self.app_pages(),
            config: NewSessionConfig {
                allow_run_on_save: config.server.allow_run_on_save,
                max_cached_message_age: config.global.max_cached_message_age,
            },
            custom_theme: populate_theme(config.theme.as_ref()),
            initialize: Initialize {
                user_info: self.user_info.clone(),
                session_id: self.id.clone(),
                session_status: self.session_status(),
                runtime_version: env!("CARGO_PKG_VERSION").to_string(),
                os: std::env::consts::OS.to_string(),
            },
        };
        ForwardMsg::new(ForwardMsgKind::NewSession(Box::new(new_session)))
    }

    pub(crate) fn create_session_status_changed_message(&self) -> ForwardMsg {
        ForwardMsg::new(ForwardMsgKind::SessionStatusChanged(self.session_status()))
    }

    pub(crate) fn create_pages_changed_message(&self) -> ForwardMsg {
        ForwardMsg::new(ForwardMsgKind::PagesChanged {
            app_pages: self.app_pages(),
        })
    }

    fn session_status(&self) -> SessionStatus {
        SessionStatus {
            run_on_save: self.run_on_save,
            script_is_running: self.state == AppSessionState::AppIsRunning,
        }
    }

    fn app_pages(&self) -> Vec<AppPage> {
        let main_hash = self.pages_manager.main_script_hash();
        self.pages_manager
            .get_pages()
            .iter()
            .map(|page: &PageInfo| page.to_app_page(page.page_script_hash == main_hash))
            .collect()
    }
}

fn script_name(path: &std::path::Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// The theme to send, or `None` when no option is set.
///
/// An unknown `base` is replaced by `light`.
pub(crate) fn populate_theme(theme: Option<&ThemeConfig>) -> Option<ThemeConfig> {
    let theme = theme?;
    if *theme == ThemeConfig::default() {
        return None;
    }

    let mut theme = theme.clone();
    if let Some(base) = theme.base.as_deref() {
        if !THEME_BASES.contains(&base) {
            warn!(
                "\"{base}\" is an invalid value for theme.base. Allowed values include \
                 {THEME_BASES:?}. Setting theme.base to \"light\"."
            );
            theme.base = Some("light".to_string());
        }
    }
    Some(theme)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_theme_when_nothing_set() {
        assert_eq!(populate_theme(None), None);
        assert_eq!(populate_theme(Some(&ThemeConfig::default())), None);
    }

    #[test]
    fn test_partial_theme_passes_through() {
        let theme = ThemeConfig {
            primary_color: Some("coral".to_string()),
            ..ThemeConfig::default()
        };
        let populated = populate_theme(Some(&theme)).unwrap();
        assert_eq!(populated.primary_color.as_deref(), Some("coral"));
        assert_eq!(populated.background_color, None);
    }

    #[test]
    fn test_invalid_base_falls_back_to_light() {
        let theme = ThemeConfig {
            base: Some("blah".to_string()),
            ..ThemeConfig::default()
        };
        assert_eq!(
            populate_theme(Some(&theme)).unwrap().base.as_deref(),
            Some("light")
        );

        let dark = ThemeConfig {
            base: Some("dark".to_string()),
            ..ThemeConfig::default()
        };
        assert_eq!(populate_theme(Some(&dark)).unwrap().base.as_deref(), Some("dark"));
    }

    #[test]
    fn test_script_name_is_file_stem() {
        assert_eq!(script_name(std::path::Path::new("/apps/hello.py")), "hello");
    }
}
