use std::env;
use std::path::PathBuf;

use tracing::warn;

/// Prefix of every signal name registered with the host.
pub const DEFAULT_SIGNAL_PREFIX: &str = "QTTabBar_";

/// Zero-based vtable slots of the methods that get intercepted or called.
///
/// These depend on the host build; the defaults match the shell interfaces
/// as they have been laid out since Windows 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    /// `IShellBrowser::BrowseObject`
    pub browse_object: usize,
    /// `ITravelLogEx::TravelToEntry`
    pub travel_to_entry: usize,
    /// `IShellBrowserService::GetTravelLog`
    pub get_travel_log: usize,
    /// `IShellFolderViewCB::MessageSFVCB`
    pub view_callback_message: usize,
    /// `IShellView3::CreateViewWindow3`
    pub create_view_window3: usize,
    /// `QueryInterface` of the items view element provider
    pub element_query_interface: usize,
}

impl Default for SlotLayout {
    fn default() -> Self {
        Self {
            browse_object: 11,
            travel_to_entry: 11,
            get_travel_log: 4,
            view_callback_message: 3,
            create_view_window3: 20,
            element_query_interface: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookConfig {
    pub signal_prefix: String,
    pub slots: SlotLayout,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            signal_prefix: DEFAULT_SIGNAL_PREFIX.to_string(),
            slots: SlotLayout::default(),
        }
    }
}

impl HookConfig {
    /// Defaults, overridden by `SHELLHOOK_SIGNAL_PREFIX` and
    /// `SHELLHOOK_SLOT_<NAME>` from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(env::vars())
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            if key == "SHELLHOOK_SIGNAL_PREFIX" {
                config.signal_prefix = value.to_string();
                continue;
            }
            let Some(name) = key.strip_prefix("SHELLHOOK_SLOT_") else {
                continue;
            };
            let slots = &mut config.slots;
            let slot = match name {
                "BROWSE_OBJECT" => &mut slots.browse_object,
                "TRAVEL_TO_ENTRY" => &mut slots.travel_to_entry,
                "GET_TRAVEL_LOG" => &mut slots.get_travel_log,
                "VIEW_CALLBACK_MESSAGE" => &mut slots.view_callback_message,
                "CREATE_VIEW_WINDOW3" => &mut slots.create_view_window3,
                "ELEMENT_QUERY_INTERFACE" => &mut slots.element_query_interface,
                _ => {
                    warn!("unknown slot override {key}");
                    continue;
                }
            };
            match value.trim().parse() {
                Ok(index) => *slot = index,
                Err(e) => warn!("ignoring {key}={value:?}: {e}"),
            }
        }
        config
    }
}

/// Where and how much to log. Logging stays off unless a filter is given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// An `EnvFilter` directive such as `shellhook=debug`.
    pub filter: Option<String>,
    pub file: PathBuf,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: None,
            file: env::temp_dir().join("shellhook.log"),
        }
    }
}

impl LogSettings {
    /// Reads `SHELLHOOK_LOG` and `SHELLHOOK_LOG_FILE`.
    pub fn from_env() -> Self {
        Self::from_vars(env::vars())
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut settings = Self::default();
        for (key, value) in vars {
            let value = value.as_ref();
            match key.as_ref() {
                "SHELLHOOK_LOG" if !value.trim().is_empty() => {
                    settings.filter = Some(value.trim().to_string())
                }
                "SHELLHOOK_LOG_FILE" if !value.is_empty() => settings.file = PathBuf::from(value),
                _ => {}
            }
        }
        settings
    }
}
