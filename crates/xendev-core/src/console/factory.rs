//! Registry of console controllers, one per domain.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use xendev_channel::{Channel, ChannelSignal};

use crate::config::ConsoleSettings;
use crate::console::{ConsoleController, ConsoleInfo, ConsolePeer, ListenerHandle, PeerId};
use crate::controller::{Controller, InstanceKey};
use crate::error::{CoreError, Result};
use crate::event::{Event, EventBus};
use crate::event_loop::{LoopEvent, LoopSender};
use crate::factory::ControllerFactory;

/// Creates consoles and routes loop events to them.
#[derive(Debug)]
pub struct ConsoleControllerFactory {
    registry: ControllerFactory<ConsoleController>,
    settings: ConsoleSettings,
    events: EventBus,
    loop_tx: LoopSender,
    next_console_id: u32,
}

impl ConsoleControllerFactory {
    /// Creates an empty factory posting socket and channel events to
    /// `loop_tx`.
    #[must_use]
    pub fn new(settings: ConsoleSettings, events: EventBus, loop_tx: LoopSender) -> Self {
        Self {
            registry: ControllerFactory::new("console"),
            settings,
            events,
            loop_tx,
            next_console_id: 1,
        }
    }

    /// Creates the console of `domid` and starts listening for terminals.
    ///
    /// The port defaults to `base_port + domid`; `Some(0)` picks any free
    /// port.
    ///
    /// # Errors
    ///
    /// Fails if the domain already has a console, the port is out of range
    /// or the listener cannot be bound.
    pub fn create_console(
        &mut self,
        domid: u32,
        mut channel: Box<dyn Channel>,
        port: Option<u16>,
    ) -> Result<&mut ConsoleController> {
        let key = InstanceKey::domain(domid);
        if self.registry.lookup(key).is_some() {
            return Err(CoreError::AlreadyExists(format!("console for domain {domid}")));
        }
        let port = match port {
            Some(port) => port,
            None => u16::try_from(u32::from(self.settings.base_port) + domid).map_err(|_| {
                CoreError::validation(format!("no console port for domain {domid}"))
            })?,
        };
        let ip: IpAddr = self.settings.bind_address.parse().map_err(|_| {
            CoreError::validation(format!(
                "invalid console bind address {}",
                self.settings.bind_address
            ))
        })?;
        let listener = ListenerHandle::bind(SocketAddr::new(ip, port), key, self.loop_tx.clone())?;

        let loop_tx = self.loop_tx.clone();
        channel.set_signal_handler(Arc::new(move |signal| {
            let _ = loop_tx.send(LoopEvent::Channel { key, signal });
        }));

        let id = self.next_console_id;
        self.next_console_id += 1;
        let mut console = ConsoleController::new(
            id,
            domid,
            port,
            channel,
            &self.settings,
            self.events.clone(),
        );
        console.listen(listener)?;
        self.events.publish(Event::ConsoleCreated {
            console: id,
            domid,
            port: console.port(),
        });
        self.registry.create_instance(console)
    }

    /// Looks up the console of `domid`.
    #[must_use]
    pub fn lookup(&self, domid: u32) -> Option<&ConsoleController> {
        self.registry.lookup(InstanceKey::domain(domid))
    }

    /// Looks up the console of `domid` for mutation.
    pub fn lookup_mut(&mut self, domid: u32) -> Option<&mut ConsoleController> {
        self.registry.lookup_mut(InstanceKey::domain(domid))
    }

    /// Summaries of all live consoles, ordered by domain.
    #[must_use]
    pub fn infos(&self) -> Vec<ConsoleInfo> {
        let mut infos: Vec<ConsoleInfo> = self.registry.iter().map(ConsoleController::info).collect();
        infos.sort_by_key(|info| info.domain);
        infos
    }

    /// Number of live consoles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// Returns true if no console is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Offers an accepted terminal to the console `key`.
    ///
    /// A refused terminal is told why and closed.
    pub fn peer_accepted(&mut self, key: InstanceKey, peer: Box<dyn ConsolePeer>) {
        let Some(console) = self.registry.lookup_mut(key) else {
            let mut peer = peer;
            peer.close();
            return;
        };
        if let Err(mut rejected) = console.connect(peer) {
            let notice = format!(
                "Cannot connect to console {} on domain {}\n",
                rejected.console,
                console.domid()
            );
            if let Err(e) = rejected.peer.write(notice.as_bytes()) {
                tracing::debug!(%key, error = %e, "could not notify rejected peer");
            }
            rejected.peer.close();
        }
    }

    /// Forwards terminal input.
    pub fn peer_input(&mut self, key: InstanceKey, peer: PeerId, data: &[u8]) {
        if let Some(console) = self.registry.lookup_mut(key) {
            console.handle_input(peer, data);
        }
    }

    /// Handles a terminal hangup.
    pub fn peer_hangup(&mut self, key: InstanceKey, peer: PeerId) {
        if let Some(console) = self.registry.lookup_mut(key) {
            console.peer_hangup(peer);
        }
    }

    /// Handles a readiness signal from a console channel.
    pub fn channel_signal(&mut self, key: InstanceKey, signal: ChannelSignal) {
        match signal {
            ChannelSignal::Readable => {
                if let Some(console) = self.registry.lookup_mut(key) {
                    console.receive_pending();
                }
            }
            ChannelSignal::Writable => {
                if let Some(console) = self.registry.lookup_mut(key) {
                    console.on_writable();
                }
            }
            ChannelSignal::Closed => self.lost_channel(key),
        }
    }

    /// Deregisters the console `key` and tears it down. Idempotent.
    pub fn lost_channel(&mut self, key: InstanceKey) {
        if let Some(mut console) = self.registry.remove_instance(key) {
            console.lost_channel();
        }
    }

    /// Closes the console of `domid`, if any.
    pub fn close_console(&mut self, domid: u32) {
        self.lost_channel(InstanceKey::domain(domid));
    }

    /// Closes every console.
    pub fn close_all(&mut self) {
        for mut console in self.registry.drain() {
            console.lost_channel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::tests::FakePeer;
    use crate::console::ConsoleState;
    use crate::event_loop::ConsoleEvent;
    use tokio::sync::mpsc;
    use xendev_channel::{Message, MemoryChannel};

    fn factory() -> (ConsoleControllerFactory, mpsc::UnboundedReceiver<LoopEvent>, EventBus) {
        let (tx, rx) = mpsc::unbounded_channel();
        let settings = ConsoleSettings {
            bind_address: "127.0.0.1".to_string(),
            ..ConsoleSettings::default()
        };
        let events = EventBus::new();
        (ConsoleControllerFactory::new(settings, events.clone(), tx), rx, events)
    }

    #[tokio::test]
    async fn test_create_console_listens_and_announces() {
        let (mut factory, _rx, events) = factory();
        let mut sub = events.subscribe();
        let (channel, _guest) = MemoryChannel::pair(4);

        let console = factory.create_console(3, Box::new(channel), Some(0)).unwrap();
        assert_eq!(console.state(), ConsoleState::Listening);
        assert_ne!(console.port(), 0);
        let port = console.port();

        assert_eq!(
            sub.recv().await.unwrap(),
            Event::ConsoleCreated {
                console: 1,
                domid: 3,
                port
            }
        );
    }

    #[tokio::test]
    async fn test_duplicate_console_rejected() {
        let (mut factory, _rx, _events) = factory();
        let (first, _g1) = MemoryChannel::pair(4);
        let (second, _g2) = MemoryChannel::pair(4);
        factory.create_console(2, Box::new(first), Some(0)).unwrap();
        let err = factory.create_console(2, Box::new(second), Some(0)).unwrap_err();
        assert!(matches!(err, CoreError::AlreadyExists(_)));
        assert_eq!(factory.len(), 1);
    }

    #[tokio::test]
    async fn test_channel_signals_reach_loop() {
        let (mut factory, mut rx, _events) = factory();
        let (channel, guest) = MemoryChannel::pair(4);
        factory.create_console(4, Box::new(channel), Some(0)).unwrap();

        guest.send_request(Message::console_data(&b"x"[..]).unwrap());
        match rx.recv().await.unwrap() {
            LoopEvent::Channel { key, signal } => {
                assert_eq!(key, InstanceKey::domain(4));
                assert_eq!(signal, ChannelSignal::Readable);
                factory.channel_signal(key, signal);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(factory.lookup(4).unwrap().pending_output(), 1);
    }

    #[tokio::test]
    async fn test_rejected_peer_is_told_and_closed() {
        let (mut factory, _rx, _events) = factory();
        let (channel, _guest) = MemoryChannel::pair(4);
        factory.create_console(5, Box::new(channel), Some(0)).unwrap();
        let key = InstanceKey::domain(5);

        let first = FakePeer::new(5001);
        factory.peer_accepted(key, Box::new(first.clone()));
        let second = FakePeer::new(5002);
        factory.peer_accepted(key, Box::new(second.clone()));

        assert_eq!(
            second.received(),
            b"Cannot connect to console 1 on domain 5\n".to_vec()
        );
        assert!(second.is_closed());
        assert!(!first.is_closed());
    }

    #[tokio::test]
    async fn test_lost_channel_removes_console() {
        let (mut factory, _rx, _events) = factory();
        let (channel, guest) = MemoryChannel::pair(4);
        factory.create_console(6, Box::new(channel), Some(0)).unwrap();
        let peer = FakePeer::new(6001);
        factory.peer_accepted(InstanceKey::domain(6), Box::new(peer.clone()));

        factory.channel_signal(InstanceKey::domain(6), ChannelSignal::Closed);
        assert!(factory.lookup(6).is_none());
        assert!(peer.is_closed());
        assert!(guest.is_closed());

        factory.lost_channel(InstanceKey::domain(6));
        assert!(factory.is_empty());
    }

    #[tokio::test]
    async fn test_default_port_is_base_plus_domid() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let settings = ConsoleSettings {
            bind_address: "127.0.0.1".to_string(),
            base_port: u16::MAX - 1,
            ..ConsoleSettings::default()
        };
        let mut factory = ConsoleControllerFactory::new(settings, EventBus::new(), tx);
        let (channel, _guest) = MemoryChannel::pair(4);
        let err = factory.create_console(5, Box::new(channel), None).unwrap_err();
        assert!(err.is_validation());
    }

    async fn next_console_event(
        rx: &mut mpsc::UnboundedReceiver<LoopEvent>,
    ) -> (InstanceKey, ConsoleEvent) {
        loop {
            let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let LoopEvent::Console { key, event } = event {
                return (key, event);
            }
        }
    }

    #[tokio::test]
    async fn test_failed_terminal_writer_frees_console() {
        let (mut factory, mut rx, _events) = factory();
        let (channel, _guest) = MemoryChannel::pair(4);
        let port = factory.create_console(8, Box::new(channel), Some(0)).unwrap().port();
        let _client = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        let (key, event) = next_console_event(&mut rx).await;
        let ConsoleEvent::Accepted(mut peer) = event else {
            panic!("expected an accepted terminal");
        };
        let id = peer.id();
        // A failing writer cancels the peer while it is attached.
        peer.close();
        factory.peer_accepted(key, peer);
        assert_eq!(factory.lookup(8).unwrap().state(), ConsoleState::Connected);

        let (key, event) = next_console_event(&mut rx).await;
        assert!(matches!(event, ConsoleEvent::Hangup { peer } if peer == id));
        factory.peer_hangup(key, id);
        assert_eq!(factory.lookup(8).unwrap().state(), ConsoleState::Listening);
    }
}
