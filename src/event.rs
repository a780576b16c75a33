//! Event bus for session lifecycle and per-packet hooks.
//!
//! Hooks run synchronously with the operation that fires them. A
//! vetoable hook reports the veto through the returned outcome; the
//! caller checks it explicitly and silently suppresses the operation.

use std::sync::{Arc, RwLock};

use crate::minecraft::packet::Packet;
use crate::session::SessionState;

/// Identity snapshot handed to hooks.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: u64,
    pub remote_ip: String,
    pub remote_port: String,
    /// Set once the session passed LoginStart.
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStage {
    /// Before the packet is handled/written. Vetoable.
    Pre,
    /// After the packet was handled/written.
    Monitor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Read,
    Write,
}

/// Outcome of a vetoable hook round.
#[derive(Debug, Clone, Copy, Default)]
pub struct HookOutcome {
    pub cancelled: bool,
}

/// Redirect event payload.
#[derive(Debug)]
pub struct RedirectEvent<'a> {
    /// Whether this is the session's first upstream.
    pub init: bool,
    pub server_name: &'a str,
    pub server_addr: &'a str,
}

#[allow(unused_variables)]
pub trait SessionHook: Send + Sync {
    /// Fired when a client connection is accepted. Vetoing closes it
    /// before any byte is processed.
    fn on_session_open(&self, session: &SessionInfo) -> HookOutcome {
        HookOutcome::default()
    }

    fn on_session_state(&self, session: &SessionInfo, state: SessionState) {}

    /// Fired before dialing a new upstream. Vetoing keeps the session
    /// on its current upstream.
    fn on_session_redirect(&self, session: &SessionInfo, event: &RedirectEvent) -> HookOutcome {
        HookOutcome::default()
    }

    fn on_session_close(&self, session: &SessionInfo) {}

    /// Fired for every packet, read and write, pre and monitor stage.
    /// Only the pre stage outcome can veto.
    fn on_packet(
        &self,
        session: &SessionInfo,
        packet: &Packet,
        stage: PacketStage,
        direction: PacketDirection,
    ) -> HookOutcome {
        HookOutcome::default()
    }
}

/// Process-wide hook registry.
pub struct EventBus {
    hooks: RwLock<Vec<Arc<dyn SessionHook>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, hook: Arc<dyn SessionHook>) {
        self.hooks.write().expect("event bus lock").push(hook);
    }

    fn snapshot(&self) -> Vec<Arc<dyn SessionHook>> {
        let hooks = self.hooks.read().expect("event bus lock");
        hooks.clone()
    }

    /// Returns whether any hook vetoed the open.
    pub fn fire_session_open(&self, session: &SessionInfo) -> bool {
        self.snapshot()
            .iter()
            .any(|hook| hook.on_session_open(session).cancelled)
    }

    pub fn fire_session_state(&self, session: &SessionInfo, state: SessionState) {
        for hook in self.snapshot() {
            hook.on_session_state(session, state);
        }
    }

    /// Returns whether any hook vetoed the redirect.
    pub fn fire_session_redirect(&self, session: &SessionInfo, event: &RedirectEvent) -> bool {
        self.snapshot()
            .iter()
            .any(|hook| hook.on_session_redirect(session, event).cancelled)
    }

    pub fn fire_session_close(&self, session: &SessionInfo) {
        for hook in self.snapshot() {
            hook.on_session_close(session);
        }
    }

    /// Fires the pre stage and returns whether any hook vetoed.
    pub fn fire_packet_pre(
        &self,
        session: &SessionInfo,
        packet: &Packet,
        direction: PacketDirection,
    ) -> bool {
        self.snapshot()
            .iter()
            .any(|hook| {
                hook.on_packet(session, packet, PacketStage::Pre, direction)
                    .cancelled
            })
    }

    pub fn fire_packet_monitor(
        &self,
        session: &SessionInfo,
        packet: &Packet,
        direction: PacketDirection,
    ) {
        for hook in self.snapshot() {
            hook.on_packet(session, packet, PacketStage::Monitor, direction);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::minecraft::packet::{Packet, StatusRequest};

    struct VetoOpen;

    impl SessionHook for VetoOpen {
        fn on_session_open(&self, _session: &SessionInfo) -> HookOutcome {
            HookOutcome { cancelled: true }
        }
    }

    struct CountPackets(AtomicUsize);

    impl SessionHook for CountPackets {
        fn on_packet(
            &self,
            _session: &SessionInfo,
            _packet: &Packet,
            stage: PacketStage,
            _direction: PacketDirection,
        ) -> HookOutcome {
            if stage == PacketStage::Monitor {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
            HookOutcome::default()
        }
    }

    fn info() -> SessionInfo {
        SessionInfo {
            session_id: 1,
            remote_ip: "127.0.0.1".into(),
            remote_port: "12345".into(),
            name: None,
        }
    }

    #[test]
    fn open_veto_propagates() {
        let bus = EventBus::new();
        assert!(!bus.fire_session_open(&info()));
        bus.register(Arc::new(VetoOpen));
        assert!(bus.fire_session_open(&info()));
    }

    #[test]
    fn monitor_stage_observes_packets() {
        let bus = EventBus::new();
        let counter = Arc::new(CountPackets(AtomicUsize::new(0)));
        bus.register(counter.clone());
        let packet = Packet::StatusRequest(StatusRequest);
        assert!(!bus.fire_packet_pre(&info(), &packet, PacketDirection::Read));
        bus.fire_packet_monitor(&info(), &packet, PacketDirection::Read);
        assert_eq!(counter.0.load(Ordering::Relaxed), 1);
    }
}
