/*!
Hooks a closed shell host so an external controller can observe and veto
what it does.

Once the library is mapped into the host and `Initialize` is called, a fixed
set of interceptions routes selected host calls through this crate:

| Interceptor | Host function | Effect |
|---|---|---|
| ObjectCreationFilter | `CoCreateInstance` | posts `NewTreeControl` for namespace tree controls |
| DragDropRegistration | `RegisterDragDrop` | lets the controller swap the drop target |
| ViewCallbackBootstrap | `SHCreateShellFolderView` | installs the two view hooks below, then retires |
| ViewMessageFilter | `IShellFolderViewCB::MessageSFVCB` | posts `ListRefreshed` |
| HeaderPolicyFilter | `IShellView3::CreateViewWindow3` | applies the header-in-all-views policy |
| NavigationVeto | `IShellBrowser::BrowseObject` | asks `BrowseObject`, skips the navigation on a veto |
| TravelEntryOverride | `ITravelLogEx::TravelToEntry` | offers travel as a back navigation |
| AccessibilityBootstrap | `UiaReturnRawElementProvider` | installs the query filter below, then retires |
| AccessibilityQueryFilter | element provider `QueryInterface` | refuses `IRawElementProviderAdviseEvents` |

The controller talks back through registered window messages, see [`relay`].

# Layout

The decisions live in [`Registry`] and are plain Rust functions that take
the original behaviour as a closure, so they are tested without a host.
Code patching sits behind [`engine::PatchBackend`]; [`patch::InlineBackend`]
rewrites function prologues on x86 and x64. The host itself sits behind
[`host::Host`]. Only the Windows binding, the native detours and the exported
symbols are Windows specific.

# Logging

Set `SHELLHOOK_LOG` to an `EnvFilter` directive (e.g. `shellhook=debug`) to
get a log file, `SHELLHOOK_LOG_FILE` to choose where it goes.
*/

mod err;
pub use err::{HookError, Status};

pub mod config;
pub mod logging;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
mod protect;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub mod patch;

pub mod com;
pub mod engine;
pub mod guard;
pub mod host;
pub mod relay;
pub mod vtable;

#[cfg(windows)]
pub mod host_win;

mod hooks;
mod registry;
pub use registry::{DetourTable, HookId, Registry};

#[cfg(all(windows, any(target_arch = "x86", target_arch = "x86_64")))]
mod exports;

#[cfg(test)]
mod testing;
