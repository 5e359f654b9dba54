//! Signals exchanged with the controlling application.
//!
//! Every signal is a registered window message named `<prefix><Signal>`.
//! Queries are sent synchronously to a window and block the calling host
//! thread until the controller's window procedure returns; there is no
//! timeout, so the controller must never wait on the thread it is answering.
//! Notifications are posted to the calling thread's own queue.

use core::ffi::c_void;
use std::ffi::CString;

use tracing::{trace, warn};

use crate::host::{Host, Hwnd};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    RegisterDragDrop,
    NewTreeControl,
    BrowseObject,
    HeaderInAllViews,
    ListRefreshed,
    IsItemsView,
}

impl Signal {
    pub const ALL: [Signal; 6] = [
        Signal::RegisterDragDrop,
        Signal::NewTreeControl,
        Signal::BrowseObject,
        Signal::HeaderInAllViews,
        Signal::ListRefreshed,
        Signal::IsItemsView,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Signal::RegisterDragDrop => "RegisterDragDrop",
            Signal::NewTreeControl => "NewTreeControl",
            Signal::BrowseObject => "BrowseObject",
            Signal::HeaderInAllViews => "HeaderInAllViews",
            Signal::ListRefreshed => "ListRefreshed",
            Signal::IsItemsView => "IsItemsView",
        }
    }

    /// Whether the signal is sent and its answer consulted.
    pub fn is_query(self) -> bool {
        !matches!(self, Signal::NewTreeControl | Signal::ListRefreshed)
    }
}

/// Message identifiers of all signals, resolved once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalCatalog {
    ids: [u32; 6],
}

impl SignalCatalog {
    /// Registers every signal name. Registering a name twice yields the same
    /// identifier, in this process and in the controller's.
    pub fn resolve<H: Host>(host: &H, prefix: &str) -> Self {
        let mut ids = [0; 6];
        for (id, signal) in ids.iter_mut().zip(Signal::ALL) {
            let name = match CString::new(format!("{prefix}{}", signal.name())) {
                Ok(name) => name,
                Err(e) => {
                    warn!("can't register {}: {e}", signal.name());
                    continue;
                }
            };
            *id = host.register_message(&name);
            if *id == 0 {
                warn!("registering {name:?} failed");
            }
        }
        Self { ids }
    }

    pub fn id(&self, signal: Signal) -> u32 {
        self.ids[signal as usize]
    }
}

/// Typed access to the signals. Without a catalog, or for a signal that
/// failed to register, queries answer 0 and notifications are dropped.
pub struct EventRelay<'a, H> {
    host: &'a H,
    catalog: Option<&'a SignalCatalog>,
}

impl<'a, H: Host> EventRelay<'a, H> {
    pub fn new(host: &'a H, catalog: Option<&'a SignalCatalog>) -> Self {
        Self { host, catalog }
    }

    fn id(&self, signal: Signal) -> Option<u32> {
        self.catalog.map(|c| c.id(signal)).filter(|id| *id != 0)
    }

    fn send(&self, hwnd: Hwnd, signal: Signal, wparam: usize, lparam: isize) -> isize {
        let Some(msg) = self.id(signal) else {
            return 0;
        };
        if hwnd.is_null() {
            return 0;
        }
        let ret = self.host.send_message(hwnd, msg, wparam, lparam);
        trace!("{} -> {hwnd:?} answered {ret}", signal.name());
        ret
    }

    fn post(&self, signal: Signal, wparam: usize) {
        if let Some(msg) = self.id(signal) {
            if !self.host.post_thread_message(msg, wparam, 0) {
                warn!("posting {} failed", signal.name());
            }
        }
    }

    /// The window that receives queries about `hwnd`: its parent, if any.
    pub fn owner_window(&self, hwnd: Hwnd) -> Hwnd {
        self.host.parent_window(hwnd).unwrap_or(hwnd)
    }

    /// Offers the drop target to the controller, which may swap it in place.
    pub fn register_drag_drop(&self, hwnd: Hwnd, drop_target: &mut *mut c_void) {
        let slot: *mut *mut c_void = drop_target;
        self.send(hwnd, Signal::RegisterDragDrop, slot as usize, 0);
    }

    pub fn notify_new_tree_control(&self, control: *mut c_void) {
        self.post(Signal::NewTreeControl, control as usize);
    }

    /// `true` when the controller vetoes (or takes over) the navigation. The
    /// controller may rewrite `flags`.
    pub fn browse_object(&self, hwnd: Hwnd, flags: &mut u32, pidl: *const c_void) -> bool {
        let flags: *mut u32 = flags;
        self.send(hwnd, Signal::BrowseObject, flags as usize, pidl as isize) != 0
    }

    pub fn header_in_all_views(&self, hwnd: Hwnd) -> bool {
        self.send(hwnd, Signal::HeaderInAllViews, 0, 0) != 0
    }

    pub fn notify_list_refreshed(&self) {
        self.post(Signal::ListRefreshed, 0);
    }

    /// Only an answer of exactly 1 counts.
    pub fn is_items_view(&self, hwnd: Hwnd) -> bool {
        self.send(hwnd, Signal::IsItemsView, 0, 0) == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;
    use std::ptr;

    const WINDOW: Hwnd = 0x100 as Hwnd;

    #[test]
    fn catalog_is_stable() {
        let host = FakeHost::new();
        let a = SignalCatalog::resolve(&host, "QTTabBar_");
        let b = SignalCatalog::resolve(&host, "QTTabBar_");
        assert_eq!(a, b);
        assert_eq!(
            host.message_name(a.id(Signal::BrowseObject)).as_deref(),
            Some("QTTabBar_BrowseObject")
        );
        let mut ids: Vec<_> = Signal::ALL.iter().map(|s| a.id(*s)).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 6);
    }

    #[test]
    fn queries_are_neutral_without_receiver() {
        let host = FakeHost::new();
        host.respond(|_| 1);
        let catalog = SignalCatalog::resolve(&host, "QTTabBar_");

        let relay = EventRelay::new(&host, Some(&catalog));
        assert!(!relay.header_in_all_views(ptr::null_mut()));
        assert!(!relay.is_items_view(ptr::null_mut()));

        let relay = EventRelay::new(&host, None);
        assert!(!relay.header_in_all_views(WINDOW));
        relay.notify_list_refreshed();
        assert!(host.sent().is_empty());
        assert!(host.posted().is_empty());
    }

    #[test]
    fn items_view_wants_exactly_one() {
        let host = FakeHost::new();
        let catalog = SignalCatalog::resolve(&host, "QTTabBar_");
        let relay = EventRelay::new(&host, Some(&catalog));
        host.respond(|_| 2);
        assert!(!relay.is_items_view(WINDOW));
        host.respond(|_| 1);
        assert!(relay.is_items_view(WINDOW));
    }

    #[test]
    fn browse_object_lets_the_receiver_rewrite_flags() {
        let host = FakeHost::new();
        let catalog = SignalCatalog::resolve(&host, "QTTabBar_");
        let relay = EventRelay::new(&host, Some(&catalog));
        host.respond(|sent| {
            unsafe { *(sent.wparam as *mut u32) |= 0x20 };
            0
        });
        let mut flags = 1;
        assert!(!relay.browse_object(WINDOW, &mut flags, 0x55 as *const c_void));
        assert_eq!(flags, 0x21);
        let sent = host.sent();
        assert_eq!(sent[0].signal, "QTTabBar_BrowseObject");
        assert_eq!(sent[0].lparam, 0x55);
    }

    #[test]
    fn notifications_go_to_the_thread_queue() {
        let host = FakeHost::new();
        let catalog = SignalCatalog::resolve(&host, "QTTabBar_");
        let relay = EventRelay::new(&host, Some(&catalog));
        relay.notify_new_tree_control(0x77 as *mut c_void);
        relay.notify_list_refreshed();
        let posted = host.posted();
        assert_eq!(posted.len(), 2);
        assert_eq!(posted[0].signal, "QTTabBar_NewTreeControl");
        assert_eq!(posted[0].wparam, 0x77);
        assert_eq!(posted[1].signal, "QTTabBar_ListRefreshed");
        assert!(host.sent().is_empty());
    }

    #[test]
    fn owner_is_the_parent_when_there_is_one() {
        let host = FakeHost::new();
        let relay = EventRelay::new(&host, None);
        assert_eq!(relay.owner_window(WINDOW), WINDOW);
        host.set_parent(WINDOW, 0x200 as Hwnd);
        assert_eq!(relay.owner_window(WINDOW), 0x200 as Hwnd);
    }
}
