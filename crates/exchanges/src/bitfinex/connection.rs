//! Connection controller: transport ownership, pause gating and reconnect
//!
//! ```text
//! Disconnected --connect--> Connecting --open--> Active <--pause/resume--> Paused
//!       ^                                           |                        |
//!       +------ close / transport closed / version mismatch / restart -------+
//! ```
//!
//! Outbound frames written while the controller is not `Active` are parked in
//! an [`ActionRegistry`] and replayed in call order when the transport opens
//! or the server ends maintenance. Every connection attempt gets a new
//! generation; teardown bumps it, which detaches the previous transport's
//! event sink and drops the per-connection routes along with the once
//! expectations of requests already written to that transport.

use crate::actions::ActionRegistry;
use crate::bitfinex::frames::{Event, Frame, InfoCode, InfoEvent};
use crate::bitfinex::types::ConnectionState;
use crate::errors::{ExchangeError, Result};
use crate::expectations::{ExpectationId, ExpectationRegistry};
use crate::transport::{Connector, Transport, TransportEvents, TransportListener};
use bfxlink_core::{PerfTimer, generate_id_with_prefix, log_error};

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use tracing::{debug, error, info, warn};
use url::Url;

type TeardownHook = Rc<dyn Fn()>;

pub struct ConnectionController {
    me: Weak<ConnectionController>,
    url: Url,
    allowed_versions: Vec<u32>,
    connector: Box<dyn Connector>,
    transport: RefCell<Option<Box<dyn Transport>>>,
    generation: Cell<u64>,
    tag: RefCell<String>,
    state: Cell<ConnectionState>,
    version_validated: Cell<bool>,
    handshake: Cell<Option<ExpectationId>>,
    pending: ActionRegistry,
    expectations: Rc<ExpectationRegistry<Frame>>,
    teardown_hooks: RefCell<Vec<TeardownHook>>,
    last_error: RefCell<Option<ExchangeError>>,
}

impl ConnectionController {
    pub fn new(
        url: Url,
        allowed_versions: Vec<u32>,
        connector: Box<dyn Connector>,
        expectations: Rc<ExpectationRegistry<Frame>>,
    ) -> Rc<Self> {
        Rc::new_cyclic(|me| Self {
            me: me.clone(),
            url,
            allowed_versions,
            connector,
            transport: RefCell::new(None),
            generation: Cell::new(0),
            tag: RefCell::new(String::new()),
            state: Cell::new(ConnectionState::Disconnected),
            version_validated: Cell::new(false),
            handshake: Cell::new(None),
            pending: ActionRegistry::new(),
            expectations,
            teardown_hooks: RefCell::new(Vec::new()),
            last_error: RefCell::new(None),
        })
    }

    /// Open a transport and wait for the server's version frame.
    ///
    /// A no-op when a transport is already attached.
    pub fn connect(&self) -> Result<()> {
        if self.transport.borrow().is_some() {
            debug!("connect ignored: {} already has a transport", self.tag.borrow());
            return Ok(());
        }

        let generation = self.generation.get() + 1;
        self.generation.set(generation);
        *self.tag.borrow_mut() = generate_id_with_prefix("CONN");
        self.state.set(ConnectionState::Connecting);
        self.version_validated.set(false);
        self.last_error.borrow_mut().take();

        let me = self.me.clone();
        let handshake = self.expectations.once(
            |frame| matches!(frame.event(), Some(Event::Info(info)) if info.version.is_some()),
            move |frame| {
                if let (Some(controller), Some(Event::Info(info))) = (me.upgrade(), frame.event()) {
                    controller.check_version(info);
                }
            },
        );
        self.handshake.set(Some(handshake));

        info!("🔗 Connecting {} to {} (generation {})", self.tag.borrow(), self.url, generation);
        let listener: Weak<dyn TransportListener> = self.me.clone();
        match self.connector.open(&self.url, TransportEvents::new(listener, generation)) {
            Ok(transport) => {
                *self.transport.borrow_mut() = Some(transport);
                Ok(())
            }
            Err(e) => {
                log_error!(format!("opening transport for {}", self.tag.borrow()), e);
                self.teardown("open failed");
                Err(e)
            }
        }
    }

    /// Close the connection and drop everything queued for it.
    ///
    /// Outstanding operations are abandoned and settle as
    /// [`ExchangeError::ConnectionClosed`].
    pub fn close(&self) {
        info!("🔌 Closing {}", self.tag.borrow());
        let discarded = self.pending.discard();
        let abandoned = self.expectations.clear_pending();
        if discarded > 0 || abandoned > 0 {
            debug!("dropped {} queued frames and {} pending expectations", discarded, abandoned);
        }
        self.teardown("client close");
    }

    /// Write `text` now if active, otherwise queue it for replay.
    ///
    /// Never fails: queued frames are flushed by the next open or resume.
    pub fn send(&self, text: String) {
        self.send_request(text, Vec::new());
    }

    /// [`send`](Self::send) a request answered by the `replies` expectations.
    ///
    /// The expectations are bound to the transport the frame is written to
    /// and dropped when that transport is torn down. While the frame sits in
    /// the queue they survive reconnects.
    pub fn send_request(&self, text: String, replies: Vec<ExpectationId>) {
        if self.is_active() {
            let result = match self.transport.borrow().as_ref() {
                Some(transport) => transport.send(&text),
                None => Err(ExchangeError::ConnectionClosed("no transport".to_string())),
            };
            if let Err(e) = result {
                warn!("❌ Send failed on {}: {}", self.tag.borrow(), e);
            }
            self.expectations.mark_in_flight(&replies);
            return;
        }

        let me = self.me.clone();
        let depth = self.pending.add(move || {
            if let Some(controller) = me.upgrade() {
                controller.send_request(text, replies);
            }
        });
        debug!("⏸️  Queued outbound frame ({} pending, state {:?})", depth, self.state.get());
    }

    /// Register a callback run after every teardown.
    pub fn on_teardown(&self, hook: impl Fn() + 'static) {
        self.teardown_hooks.borrow_mut().push(Rc::new(hook));
    }

    pub fn expectations(&self) -> &Rc<ExpectationRegistry<Frame>> {
        &self.expectations
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_active(&self) -> bool {
        self.state.get() == ConnectionState::Active
            && self.transport.borrow().as_ref().is_some_and(|t| t.is_open())
    }

    pub fn is_connected(&self) -> bool {
        self.state.get() != ConnectionState::Disconnected
            && self.transport.borrow().as_ref().is_some_and(|t| t.is_open())
    }

    pub fn is_version_validated(&self) -> bool {
        self.version_validated.get()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn generation(&self) -> u64 {
        self.generation.get()
    }

    /// Tag of the current (or last) connection attempt, for log correlation
    pub fn connection_tag(&self) -> String {
        self.tag.borrow().clone()
    }

    /// The error that ended the last connection attempt, if any
    pub fn last_error(&self) -> Option<ExchangeError> {
        self.last_error.borrow().clone()
    }

    fn check_version(&self, info: &InfoEvent) {
        self.handshake.set(None);
        let version = info.version;
        if version.is_some_and(|v| self.allowed_versions.contains(&v)) {
            info!("✅ Protocol version {:?} accepted on {}", version, self.tag.borrow());
            self.version_validated.set(true);
            return;
        }

        error!(
            "❌ Unexpected protocol version {:?} on {} (allowed {:?}), closing",
            version,
            self.tag.borrow(),
            self.allowed_versions
        );
        *self.last_error.borrow_mut() = Some(ExchangeError::ProtocolVersion {
            version,
            allowed: self.allowed_versions.clone(),
        });
        self.teardown("version mismatch");
    }

    /// Frames no expectation consumed
    fn housekeeping(&self, frame: &Frame) {
        match frame {
            Frame::Event(Event::Info(info)) => self.process_info(info),
            Frame::Event(Event::Error(err)) => {
                warn!("⚠️  Server error {:?}: {}", err.code, err.message());
            }
            Frame::Channel(channel) if channel.is_heartbeat() => {
                debug!("💓 Unrouted heartbeat on channel {}", channel.chan_id);
            }
            other => debug!("Unprocessed frame: {:?}", other),
        }
    }

    fn process_info(&self, info: &InfoEvent) {
        let Some(code) = info.code else {
            debug!("Info frame without code: {:?}", info);
            return;
        };

        match InfoCode::from(code) {
            InfoCode::Restart => self.restart(),
            InfoCode::Pause => self.pause(),
            InfoCode::Resume => self.resume(),
            InfoCode::Other(code) => {
                info!("Unknown info code {} ({:?}), ignoring", code, info.msg);
            }
        }
    }

    fn pause(&self) {
        if self.state.get() == ConnectionState::Active {
            info!("⏸️  Server maintenance: pausing {}", self.tag.borrow());
            self.state.set(ConnectionState::Paused);
        }
    }

    fn resume(&self) {
        match self.state.get() {
            ConnectionState::Paused | ConnectionState::Active => {
                info!("▶️  Resuming {}", self.tag.borrow());
                self.state.set(ConnectionState::Active);
                let replayed = self.pending.fire();
                if replayed > 0 {
                    debug!("replayed {} queued frames", replayed);
                }
            }
            state => debug!("resume ignored in state {:?}", state),
        }
    }

    fn restart(&self) {
        info!("🔄 Server requested reconnect for {}", self.tag.borrow());
        self.teardown("server restart");
        if let Err(e) = self.connect() {
            log_error!("reconnect", e);
        }
    }

    /// Detach the transport and drop per-connection state.
    fn teardown(&self, reason: &str) {
        self.generation.set(self.generation.get() + 1);

        let transport = self.transport.borrow_mut().take();
        if let Some(transport) = transport {
            transport.close();
        }
        if let Some(id) = self.handshake.take() {
            self.expectations.cancel(id);
        }
        let routes = self.expectations.clear_routes();
        let unanswered = self.expectations.drop_in_flight();
        self.version_validated.set(false);
        self.state.set(ConnectionState::Disconnected);
        debug!(
            "Teardown of {} ({}): dropped {} routes and {} unanswered requests",
            self.tag.borrow(),
            reason,
            routes,
            unanswered
        );

        let hooks: Vec<TeardownHook> = self.teardown_hooks.borrow().clone();
        for hook in hooks {
            hook();
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        generation == self.generation.get()
    }
}

impl TransportListener for ConnectionController {
    fn on_open(&self, generation: u64) {
        if !self.is_current(generation) {
            debug!("Ignoring open from stale transport (generation {})", generation);
            return;
        }
        info!("✅ Transport open for {}", self.tag.borrow());
        self.state.set(ConnectionState::Paused);
        self.resume();
    }

    fn on_message(&self, generation: u64, text: &str) {
        if !self.is_current(generation) {
            return;
        }

        let _timer = PerfTimer::start("frame_dispatch");
        match Frame::decode(text) {
            Ok(frame) => {
                if !self.expectations.dispatch(&frame) {
                    self.housekeeping(&frame);
                }
            }
            Err(e) => debug!("Dropping undecodable frame ({}): {}", e, text),
        }
    }

    fn on_close(&self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        warn!("🔌 Transport closed for {}", self.tag.borrow());
        self.teardown("transport closed");
    }
}

impl std::fmt::Debug for ConnectionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionController")
            .field("url", &self.url.as_str())
            .field("tag", &*self.tag.borrow())
            .field("generation", &self.generation.get())
            .field("state", &self.state.get())
            .field("pending", &self.pending.len())
            .finish()
    }
}
