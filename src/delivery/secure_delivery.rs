use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::{PhaseProfile, TimeoutProfile};
use crate::crypto::{Aes256GcmCrypto, AsymmetricCrypto, KeyPair, SealedBoxCrypto, SymmetricCrypto};
use crate::delivery::receivers::ReceiverRegistry;
use crate::delivery::session::{Role, Session, Stage};
use crate::error::{LetterError, NoConnection, WireError};
use crate::messenger::{Messenger, Receptor};
use crate::receiver::SecureReceiver;
use crate::retry::{TickScheduler, TimeoutTask, DEFAULT_TICK_INTERVAL};
use crate::wire::letter;
use crate::wire::operation::Operation;
use crate::wire::packet::{Packet, PacketHead};

/// Fixed datagrams carried by locally initiated teardowns.
pub mod reasons {
    pub const TIMEOUT: &[u8] = b"TIMEOUT";
    pub const BAD_PACKET: &[u8] = b"BAD_PACKET";
    pub const CONNECT_REJECT: &[u8] = b"CONNECT_REJECT";
    pub const BAD_SESSION_KEY: &[u8] = b"BAD_SESSION_KEY";
    pub const INVALID_SESSION_KEY: &[u8] = b"INVALID_SESSION_KEY";
}

/// What a fired timeout task means to the session that armed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    ConnectResend,
    PublicKeyOfferResend,
    StartSessionResend,
    ConnectionEstablishResend,
    StandByWait,
    KeepAlive,
    ConnectionDeadline,
}

pub type DeliveryScheduler = TickScheduler<TimerKind>;

type Task = Arc<TimeoutTask<TimerKind>>;

/// Everything a delivery instance needs besides its transport: timeouts, ciphers, the
///  long-lived key pair and the shared timeout scheduler.
pub struct DeliveryConfig {
    pub timeout_profile: TimeoutProfile,
    pub asym_crypto: Arc<dyn AsymmetricCrypto>,
    pub sym_crypto: Arc<dyn SymmetricCrypto>,
    pub key_pair: KeyPair,
    pub scheduler: DeliveryScheduler,
}

impl DeliveryConfig {
    /// The default stack: X25519 sealed box, AES-256-GCM, a freshly generated key pair and
    ///  a dedicated tick scheduler. Must be called from within a tokio runtime.
    pub fn default_stack() -> DeliveryConfig {
        let asym_crypto = Arc::new(SealedBoxCrypto);
        let key_pair = asym_crypto.generate_key_pair();

        DeliveryConfig {
            timeout_profile: TimeoutProfile::default(),
            asym_crypto,
            sym_crypto: Arc::new(Aes256GcmCrypto),
            key_pair,
            scheduler: TickScheduler::spawn(DEFAULT_TICK_INTERVAL),
        }
    }
}

enum Event {
    Connect { datagram: Vec<u8> },
    RespondConnect { accept: bool },
    ConnectStandBy,
    RespondPublicKey { accept: bool },
    PublicKeyStandBy,
    SendData { tag: u64, data: Vec<u8> },
    KeepAlive,
    Disconnect { datagram: Vec<u8> },
    Inbound { raw: Vec<u8> },
}

/// One endpoint of the protocol: a reusable, one-to-one secure session over an unreliable
///  transport. A server talking to many peers needs one delivery per peer.
///
/// The handle is cheap to clone. All calls are posted onto the instance's single event
///  loop, so none of them blocks; the only call with a synchronous result is [`send`],
///  which fails fast when no connection is established.
///
/// [`send`]: SecureDelivery::send
#[derive(Clone)]
pub struct SecureDelivery {
    channel_name: String,
    messenger: Arc<dyn Messenger>,
    events: mpsc::UnboundedSender<Event>,
    receivers: Arc<ReceiverRegistry>,
    stage_cell: Arc<AtomicU8>,
}

impl SecureDelivery {
    /// Creates the instance and registers it with the transport under `channel_name`.
    ///  Must be called from within a tokio runtime.
    pub fn new(
        channel_name: impl Into<String>,
        messenger: Arc<dyn Messenger>,
        config: DeliveryConfig,
    ) -> SecureDelivery {
        let channel_name = channel_name.into();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let receivers = Arc::new(ReceiverRegistry::new());
        let stage_cell = Arc::new(AtomicU8::new(Stage::NotConnected.into()));

        messenger.register_receptor(
            &channel_name,
            Arc::new(EventReceptor {
                events: event_tx.clone(),
            }),
        );

        let inner = DeliveryInner {
            channel_name: channel_name.clone(),
            messenger: messenger.clone(),
            receivers: receivers.clone(),
            profile: config.timeout_profile.normalized(),
            scheduler: config.scheduler,
            asym_crypto: config.asym_crypto,
            sym_crypto: config.sym_crypto,
            key_pair: config.key_pair,
            session: Session::new(),
            stage_cell: stage_cell.clone(),
            timer_tx,
            resend_task: None,
            standby_task: None,
            keep_alive_task: None,
            deadline_task: None,
            last_sent: None,
            peer_public_key: None,
            pre_request_re_sends: 0,
            last_inbound: Instant::now(),
        };
        tokio::spawn(inner.run(event_rx, timer_rx));

        SecureDelivery {
            channel_name,
            messenger,
            events: event_tx,
            receivers,
            stage_cell,
        }
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    /// The current handshake stage, as last published by the event loop.
    pub fn stage(&self) -> Stage {
        Stage::try_from(self.stage_cell.load(Ordering::Acquire)).unwrap_or(Stage::NotConnected)
    }

    /// Starts a connection attempt as requester, carrying an application datagram. A
    ///  no-op unless the session is unconnected.
    pub fn connect(&self, datagram: impl Into<Vec<u8>>) {
        self.post(Event::Connect {
            datagram: datagram.into(),
        });
    }

    /// The application's answer to [`SecureReceiver::on_connect`]. Rejecting winds the
    ///  session up with a CONNECT_REJECT datagram.
    pub fn respond_connect(&self, accept: bool) {
        self.post(Event::RespondConnect { accept });
    }

    /// Tells the requester that this endpoint is alive but still deciding about its
    ///  connection request. Resets the requester's standby-wait timer only.
    pub fn connect_stand_by(&self) {
        self.post(Event::ConnectStandBy);
    }

    /// The application's answer to [`SecureReceiver::on_public_key_respond`].
    pub fn respond_public_key(&self, accept: bool) {
        self.post(Event::RespondPublicKey { accept });
    }

    /// Tells the acceptor that this endpoint is alive but still deciding about the offered
    ///  public key.
    pub fn public_key_stand_by(&self) {
        self.post(Event::PublicKeyStandBy);
    }

    /// Encrypts and sends application data under a caller-supplied correlation tag. The
    ///  peer answers with a confirm or broken notification carrying the same tag.
    pub fn send(&self, tag: u64, data: impl Into<Vec<u8>>) -> Result<(), NoConnection> {
        self.check_connection()?;
        self.post(Event::SendData {
            tag,
            data: data.into(),
        });
        Ok(())
    }

    /// Manually sends a keep-alive packet.
    pub fn keep_alive(&self) -> Result<(), NoConnection> {
        self.check_connection()?;
        self.post(Event::KeepAlive);
        Ok(())
    }

    /// Tears the session down, notifying the peer best-effort with the given datagram.
    pub fn disconnect(&self, datagram: impl Into<Vec<u8>>) {
        self.post(Event::Disconnect {
            datagram: datagram.into(),
        });
    }

    pub fn register_receiver(&self, channel_name: impl Into<String>, receiver: Arc<dyn SecureReceiver>) {
        self.receivers.register(channel_name, receiver);
    }

    pub fn unregister_receiver(&self, channel_name: &str) {
        self.receivers.unregister(channel_name);
    }

    /// Detaches the instance from the transport. The session object itself stays usable
    ///  for observers already registered but no longer sees inbound traffic.
    pub fn shutdown(&self) {
        self.messenger.unregister_receptor(&self.channel_name);
    }

    fn check_connection(&self) -> Result<(), NoConnection> {
        if self.stage() == Stage::Connected {
            Ok(())
        }
        else {
            Err(NoConnection)
        }
    }

    fn post(&self, event: Event) {
        if self.events.send(event).is_err() {
            debug!("delivery event loop for {:?} is gone - dropping call", self.channel_name);
        }
    }
}

struct EventReceptor {
    events: mpsc::UnboundedSender<Event>,
}
impl Receptor for EventReceptor {
    fn receive(&self, data: &[u8]) {
        let _ = self.events.send(Event::Inbound { raw: data.to_vec() });
    }
}

/// The frame most recently sent to advance the handshake, kept for resends. `from_stage`
///  is the stage this frame advances the peer out of, which is what BROKEN_PRE_REQUEST
///  recovery keys on.
struct LastSent {
    from_stage: Stage,
    frame: Vec<u8>,
}

struct DeliveryInner {
    channel_name: String,
    messenger: Arc<dyn Messenger>,
    receivers: Arc<ReceiverRegistry>,
    profile: TimeoutProfile,
    scheduler: DeliveryScheduler,
    asym_crypto: Arc<dyn AsymmetricCrypto>,
    sym_crypto: Arc<dyn SymmetricCrypto>,
    key_pair: KeyPair,
    session: Session,
    stage_cell: Arc<AtomicU8>,
    timer_tx: mpsc::UnboundedSender<Task>,
    resend_task: Option<Task>,
    standby_task: Option<Task>,
    keep_alive_task: Option<Task>,
    deadline_task: Option<Task>,
    last_sent: Option<LastSent>,
    peer_public_key: Option<Vec<u8>>,
    pre_request_re_sends: u32,
    last_inbound: Instant,
}

impl DeliveryInner {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>, mut timers: mpsc::UnboundedReceiver<Task>) {
        trace!("starting event loop for delivery {:?}", self.channel_name);
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                task = timers.recv() => match task {
                    Some(task) => self.handle_timer(task),
                    None => break,
                },
            }
        }
        debug!("event loop for delivery {:?} terminated", self.channel_name);
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Connect { datagram } => self.api_connect(&datagram),
            Event::RespondConnect { accept } => self.api_respond_connect(accept),
            Event::ConnectStandBy => self.api_connect_stand_by(),
            Event::RespondPublicKey { accept } => self.api_respond_public_key(accept),
            Event::PublicKeyStandBy => self.api_public_key_stand_by(),
            Event::SendData { tag, data } => self.api_send(tag, &data),
            Event::KeepAlive => self.api_keep_alive(),
            Event::Disconnect { datagram } => self.api_disconnect(&datagram),
            Event::Inbound { raw } => self.on_inbound(&raw),
        }
    }

    // ------------------------------------------------------------------------------------
    // API calls (already serialized onto the event loop)
    // ------------------------------------------------------------------------------------

    fn api_connect(&mut self, datagram: &[u8]) {
        if self.session.stage() != Stage::NotConnected {
            debug!("connect() outside NOT_CONNECTED - ignoring");
            return;
        }

        self.session.resample_session_id();
        self.session.assign_role(Role::Requester);
        self.set_stage(Stage::ConnectRequestSent);

        let frame = self.send_packet(Operation::Connect, 0, letter::wrap(datagram));
        self.last_sent = Some(LastSent {
            from_stage: Stage::NotConnected,
            frame,
        });
        self.arm_resend(TimerKind::ConnectResend);
        self.arm_standby_wait(self.profile.public_key_offer_wait);
    }

    fn api_respond_connect(&mut self, accept: bool) {
        if self.session.stage() != Stage::ConnectRequestSent || self.session.role() != Some(Role::Acceptor) {
            debug!("respond_connect() outside its stage - ignoring");
            return;
        }

        if !accept {
            self.wind_up(reasons::CONNECT_REJECT);
            return;
        }

        let public_key = self.key_pair.public_key.clone();
        let frame = self.send_packet(Operation::PublicKeyOffer, 0, letter::wrap(&public_key));
        self.last_sent = Some(LastSent {
            from_stage: Stage::ConnectRequestSent,
            frame,
        });
        self.set_stage(Stage::PublicKeyOffered);
        self.arm_resend(TimerKind::PublicKeyOfferResend);
        self.arm_standby_wait(self.profile.start_session_wait);
    }

    fn api_connect_stand_by(&mut self) {
        if self.session.stage() != Stage::ConnectRequestSent || self.session.role() != Some(Role::Acceptor) {
            debug!("connect_stand_by() outside its stage - ignoring");
            return;
        }
        self.send_packet(Operation::ConnectStandBy, 0, Vec::new());
    }

    fn api_respond_public_key(&mut self, accept: bool) {
        if self.session.stage() != Stage::PublicKeyOffered || self.session.role() != Some(Role::Requester) {
            debug!("respond_public_key() outside its stage - ignoring");
            return;
        }

        if !accept {
            self.wind_up(reasons::CONNECT_REJECT);
            return;
        }

        let Some(peer_public_key) = self.peer_public_key.clone() else {
            debug!("no public key cached - ignoring respond_public_key()");
            return;
        };

        let session_key = self.sym_crypto.generate_key();
        match self.asym_crypto.encrypt(&session_key, &peer_public_key) {
            Ok(ciphertext) => {
                self.session.set_session_key(session_key);
                self.session.set_pending_encrypted_session_key(ciphertext.clone());

                let frame = self.send_packet(Operation::StartSession, 0, letter::wrap(&ciphertext));
                self.last_sent = Some(LastSent {
                    from_stage: Stage::PublicKeyOffered,
                    frame,
                });
                self.set_stage(Stage::SessionKeySent);
                self.arm_resend(TimerKind::StartSessionResend);
            }
            Err(e) => {
                warn!("failed to encrypt the session key with the offered public key: {}", e);
                self.wind_up(reasons::INVALID_SESSION_KEY);
            }
        }
    }

    fn api_public_key_stand_by(&mut self) {
        if self.session.stage() != Stage::PublicKeyOffered || self.session.role() != Some(Role::Requester) {
            debug!("public_key_stand_by() outside its stage - ignoring");
            return;
        }
        self.send_packet(Operation::PublicKeyStandBy, 0, Vec::new());
    }

    fn api_send(&mut self, tag: u64, data: &[u8]) {
        if self.session.stage() != Stage::Connected {
            debug!("send() raced a teardown - dropping data for tag {}", tag);
            return;
        }
        let Some(session_key) = self.session.session_key().map(<[u8]>::to_vec) else {
            debug!("no session key in CONNECTED stage - dropping data for tag {}", tag);
            return;
        };

        match letter::wrap_and_encrypt(data, self.sym_crypto.as_ref(), &session_key) {
            Ok(encrypted) => {
                self.send_packet(Operation::SendData, tag, encrypted);
            }
            Err(e) => {
                warn!("failed to encrypt data for tag {}: {}", tag, e);
                self.wind_up(reasons::INVALID_SESSION_KEY);
            }
        }
    }

    fn api_keep_alive(&mut self) {
        if self.session.stage() != Stage::Connected {
            debug!("keep_alive() raced a teardown - ignoring");
            return;
        }
        self.send_packet(Operation::KeepAlive, 0, Vec::new());
    }

    fn api_disconnect(&mut self, datagram: &[u8]) {
        if self.session.stage() == Stage::NotConnected {
            debug!("disconnect() without a session - ignoring");
            return;
        }
        self.wind_up(datagram);
    }

    // ------------------------------------------------------------------------------------
    // inbound frames
    // ------------------------------------------------------------------------------------

    fn on_inbound(&mut self, raw: &[u8]) {
        match Packet::deser(raw) {
            Ok(packet) => {
                self.pre_request_re_sends = 0;
                self.resolve(packet);
            }
            Err(WireError::UnknownOperation(op)) => {
                // the head is authentic, so this is a version mismatch rather than corruption
                debug!("inbound frame with unknown operation {} - ignoring", op);
            }
            Err(e) => self.on_broken_inbound(e),
        }
    }

    fn on_broken_inbound(&mut self, error: WireError) {
        let stage = self.session.stage();
        if stage >= Stage::Connected {
            debug!("corrupt inbound frame while connected ({}) - ignoring", error);
            return;
        }

        debug!("corrupt inbound frame in stage {:?}: {}", stage, error);
        if stage == Stage::NotConnected {
            self.send_broken_pre_request();
        }
        else if self.pre_request_re_sends < self.profile.pre_request_re_sends {
            self.pre_request_re_sends += 1;
            self.send_broken_pre_request();
        }
        else {
            self.wind_up(reasons::BAD_PACKET);
        }
    }

    fn send_broken_pre_request(&mut self) {
        let stage = u8::from(self.session.stage()) as u64;
        self.send_packet(Operation::BrokenPreRequest, stage, Vec::new());
    }

    fn resolve(&mut self, packet: Packet) {
        let head = packet.head;
        let stage = self.session.stage();

        let bootstrap = stage == Stage::NotConnected && head.operation == Operation::Connect;
        if head.session_id != self.session.session_id()
            && !bootstrap
            && head.operation != Operation::BrokenPreRequest
        {
            debug!("inbound frame for foreign session {:016x} - ignoring", head.session_id);
            return;
        }

        if stage == Stage::Connected {
            self.last_inbound = Instant::now();
        }

        match (stage, head.operation) {
            (Stage::NotConnected, Operation::Connect) => self.on_connect_request(&packet),
            (Stage::ConnectRequestSent, Operation::PublicKeyOffer) if self.is(Role::Requester) => {
                self.on_public_key_offer(&packet)
            }
            (Stage::ConnectRequestSent, Operation::ConnectStandBy) if self.is(Role::Requester) => {
                self.on_stand_by(self.profile.public_key_offer_wait)
            }
            (Stage::PublicKeyOffered, Operation::StartSession) if self.is(Role::Acceptor) => {
                self.on_start_session(&packet)
            }
            (Stage::PublicKeyOffered, Operation::PublicKeyStandBy) if self.is(Role::Acceptor) => {
                self.on_stand_by(self.profile.start_session_wait)
            }
            (Stage::SessionKeySent, Operation::ConfirmSession) if self.is(Role::Requester) => {
                self.on_confirm_session(&packet)
            }
            (Stage::SessionVerificationSent, Operation::ConnectionEstablish) if self.is(Role::Acceptor) => {
                self.on_connection_establish(&head)
            }
            (Stage::ConnectionEstablishing, Operation::ConnectionConfirm) if self.is(Role::Requester) => {
                self.complete_establish();
            }
            (Stage::ConnectionEstablishing, Operation::SendData) if self.is(Role::Requester) => {
                // the confirm was lost or overtaken - the peer is provably connected
                self.complete_establish();
                self.on_send_data(&packet);
            }
            (Stage::Connected, Operation::SendData) => self.on_send_data(&packet),
            (Stage::Connected, Operation::ConfirmData) => self.receivers.broadcast_post_confirm(head.tag),
            (Stage::Connected, Operation::BrokenData) => self.receivers.broadcast_post_broken(head.tag),
            (Stage::Connected, Operation::KeepAlive) => {
                // nothing to be done - any decoded inbound frame refreshes the deadline
            }
            (_, Operation::Disconnect) if stage != Stage::NotConnected => self.on_disconnect(&packet),
            (_, Operation::BrokenPreRequest) => self.on_broken_pre_request(&head),
            (stage, operation) => {
                debug!("operation {:?} is not applicable in stage {:?} - ignoring", operation, stage);
            }
        }
    }

    fn is(&self, role: Role) -> bool {
        self.session.role() == Some(role)
    }

    /// Stage 0, acceptor-to-be: adopt the requester's session id and ask the application.
    fn on_connect_request(&mut self, packet: &Packet) {
        let datagram = match letter::resolve(&packet.letter) {
            Ok(datagram) => datagram,
            Err(e) => return self.on_broken_inbound(e),
        };

        self.session.adopt_session_id(packet.head.session_id);
        self.session.assign_role(Role::Acceptor);
        self.set_stage(Stage::ConnectRequestSent);
        self.receivers.broadcast_on_connect(&datagram);
    }

    /// Stage 1, requester: the acceptor's public key arrived, ask the application.
    fn on_public_key_offer(&mut self, packet: &Packet) {
        let public_key = match letter::resolve(&packet.letter) {
            Ok(public_key) => public_key,
            Err(e) => return self.on_broken_inbound(e),
        };

        self.cancel_resend();
        self.cancel_standby();
        self.peer_public_key = Some(public_key.clone());
        self.set_stage(Stage::PublicKeyOffered);
        self.receivers.broadcast_on_public_key_respond(&public_key);
    }

    /// Stage 2, acceptor: decrypt the offered session key and prove possession.
    fn on_start_session(&mut self, packet: &Packet) {
        let ciphertext = match letter::resolve(&packet.letter) {
            Ok(ciphertext) => ciphertext,
            Err(e) => return self.on_broken_inbound(e),
        };

        let session_key = match self.asym_crypto.decrypt(&ciphertext, &self.key_pair.private_key) {
            Ok(session_key) => session_key,
            Err(e) => {
                debug!("session key does not decrypt with our private key: {}", e);
                self.wind_up(reasons::BAD_SESSION_KEY);
                return;
            }
        };

        // the confirmation is the session key encrypted with itself - proof of possession
        match letter::wrap_and_encrypt(&session_key, self.sym_crypto.as_ref(), &session_key) {
            Ok(encrypted) => {
                self.cancel_resend();
                self.cancel_standby();
                self.session.set_session_key(session_key);

                let frame = self.send_packet(Operation::ConfirmSession, 0, encrypted);
                self.last_sent = Some(LastSent {
                    from_stage: Stage::SessionKeySent,
                    frame,
                });
                self.set_stage(Stage::SessionVerificationSent);
                self.arm_resend(TimerKind::ConnectionEstablishResend);
            }
            Err(e) => {
                warn!("failed to self-encrypt the session key: {}", e);
                self.wind_up(reasons::INVALID_SESSION_KEY);
            }
        }
    }

    /// Stage 3, requester: the acceptor echoed the session key, verify it.
    fn on_confirm_session(&mut self, packet: &Packet) {
        let Some(session_key) = self.session.session_key().map(<[u8]>::to_vec) else {
            debug!("CONFIRM_SESSION without a generated session key - ignoring");
            return;
        };

        match letter::decrypt_and_resolve(&packet.letter, self.sym_crypto.as_ref(), &session_key) {
            Ok(echoed) if echoed == session_key => {
                self.cancel_resend();

                let frame = self.send_packet(Operation::ConnectionEstablish, 0, Vec::new());
                self.last_sent = Some(LastSent {
                    from_stage: Stage::SessionVerificationSent,
                    frame,
                });
                self.set_stage(Stage::ConnectionEstablishing);
                self.arm_resend(TimerKind::ConnectionEstablishResend);
            }
            Ok(_) => {
                debug!("peer echoed a different session key");
                self.wind_up(reasons::BAD_SESSION_KEY);
            }
            Err(LetterError::Crypto(e)) => {
                debug!("session key confirmation does not decrypt: {}", e);
                self.wind_up(reasons::BAD_SESSION_KEY);
            }
            Err(LetterError::Broken(e)) => self.on_broken_inbound(e),
        }
    }

    /// Stage 4, acceptor: the requester is satisfied - the session is established.
    fn on_connection_establish(&mut self, _head: &PacketHead) {
        self.cancel_resend();
        self.set_stage(Stage::Connected);
        self.receivers.broadcast_on_connection_establish();

        let frame = self.send_packet(Operation::ConnectionConfirm, 0, Vec::new());
        self.last_sent = Some(LastSent {
            from_stage: Stage::ConnectionEstablishing,
            frame,
        });
        self.arm_connected_timers();
    }

    /// Stage 5, requester: the acceptor confirmed (explicitly or via first data).
    fn complete_establish(&mut self) {
        self.cancel_resend();
        self.set_stage(Stage::Connected);
        self.receivers.broadcast_on_connection_establish();
        self.arm_connected_timers();
    }

    fn on_send_data(&mut self, packet: &Packet) {
        let tag = packet.head.tag;
        let Some(session_key) = self.session.session_key().map(<[u8]>::to_vec) else {
            debug!("SEND_DATA without a session key - ignoring");
            return;
        };

        match letter::decrypt_and_resolve(&packet.letter, self.sym_crypto.as_ref(), &session_key) {
            Ok(data) => {
                self.receivers.broadcast_receive(tag, &data);
                self.send_packet(Operation::ConfirmData, tag, Vec::new());
            }
            Err(e) => {
                debug!("broken data letter for tag {}: {}", tag, e);
                self.send_packet(Operation::BrokenData, tag, Vec::new());
            }
        }
    }

    fn on_disconnect(&mut self, packet: &Packet) {
        let datagram = letter::resolve(&packet.letter).ok();
        debug!("peer disconnected session {:016x}", self.session.session_id());
        self.teardown(datagram.as_deref());
    }

    /// The peer could not decode a frame. `tag` carries the stage the peer is stuck in.
    fn on_broken_pre_request(&mut self, head: &PacketHead) {
        let peer_stage = head.tag;
        let local_stage = u8::from(self.session.stage()) as u64;

        if peer_stage == 0 && self.session.stage() == Stage::ConnectRequestSent {
            // the peer lost our CONNECT before adopting the session id, so its session id
            //  cannot match ours
            self.resend_last(Stage::NotConnected);
        }
        else if head.session_id == self.session.session_id() && local_stage == peer_stage.wrapping_add(1) {
            if let Ok(from_stage) = Stage::try_from(peer_stage as u8) {
                self.resend_last(from_stage);
            }
        }
        else {
            debug!(
                "BROKEN_PRE_REQUEST for peer stage {} does not match local stage {} - ignoring",
                peer_stage, local_stage
            );
        }
    }

    fn on_stand_by(&mut self, wait_timeout: Duration) {
        trace!("peer acknowledged liveness for session {:016x}", self.session.session_id());
        // the peer has proven receipt of the outstanding frame, so resending it is pointless;
        //  the attempt count is deliberately left untouched
        self.cancel_resend();
        self.arm_standby_wait(wait_timeout);
    }

    fn resend_last(&mut self, from_stage: Stage) {
        if from_stage == Stage::PublicKeyOffered {
            // rebuild from the cached ciphertext - a resend must never re-encrypt, the
            //  acceptor has to see the same bytes it lost
            if let Some(ciphertext) = self.session.pending_encrypted_session_key().map(<[u8]>::to_vec) {
                self.send_packet(Operation::StartSession, 0, letter::wrap(&ciphertext));
                return;
            }
        }

        match &self.last_sent {
            Some(last) if last.from_stage == from_stage => {
                trace!("resending the frame advancing from stage {:?}", from_stage);
                self.messenger.send(&last.frame);
            }
            _ => debug!("no cached frame advancing from stage {:?} - ignoring", from_stage),
        }
    }

    // ------------------------------------------------------------------------------------
    // timers
    // ------------------------------------------------------------------------------------

    fn handle_timer(&mut self, task: Task) {
        if task.is_cancelled() {
            return;
        }

        match task.kind() {
            TimerKind::ConnectResend
            | TimerKind::PublicKeyOfferResend
            | TimerKind::StartSessionResend
            | TimerKind::ConnectionEstablishResend => self.on_resend_timer(&task),
            TimerKind::StandByWait => {
                debug!("standby wait expired for session {:016x}", self.session.session_id());
                self.wind_up(reasons::TIMEOUT);
            }
            TimerKind::KeepAlive => {
                if self.session.stage() == Stage::Connected {
                    self.send_packet(Operation::KeepAlive, 0, Vec::new());
                    self.scheduler.schedule(&task, self.profile.keep_alive_delay);
                }
            }
            TimerKind::ConnectionDeadline => {
                if self.session.stage() == Stage::Connected {
                    let idle = Instant::now().saturating_duration_since(self.last_inbound);
                    if idle >= self.profile.connection_timeout {
                        debug!("no inbound traffic for {:?} - closing session", idle);
                        self.wind_up(reasons::TIMEOUT);
                    }
                    else {
                        self.scheduler.schedule(&task, self.profile.connection_timeout - idle);
                    }
                }
            }
        }
    }

    fn on_resend_timer(&mut self, task: &Task) {
        let stage = self.session.stage();
        let stage_matches = match task.kind() {
            TimerKind::ConnectResend => stage == Stage::ConnectRequestSent && self.is(Role::Requester),
            TimerKind::PublicKeyOfferResend => stage == Stage::PublicKeyOffered && self.is(Role::Acceptor),
            TimerKind::StartSessionResend => stage == Stage::SessionKeySent,
            TimerKind::ConnectionEstablishResend => {
                stage == Stage::SessionVerificationSent || stage == Stage::ConnectionEstablishing
            }
            _ => false,
        };
        if !stage_matches {
            debug!("{:?} fired in stage {:?} - ignoring", task.kind(), stage);
            return;
        }

        let profile = self.resend_profile(task.kind());
        if profile.re_sends.allows(task.attempts_used()) {
            if let Some(last) = &self.last_sent {
                trace!(
                    "resend attempt {} for {:?} in session {:016x}",
                    task.attempts_used() + 1,
                    task.kind(),
                    self.session.session_id()
                );
                self.messenger.send(&last.frame);
            }
            task.bump_attempts();
            self.scheduler.schedule(task, profile.timeout);
        }
        else {
            debug!("resend budget for {:?} exhausted", task.kind());
            self.wind_up(reasons::TIMEOUT);
        }
    }

    fn resend_profile(&self, kind: TimerKind) -> PhaseProfile {
        match kind {
            TimerKind::ConnectResend => self.profile.connect_request,
            TimerKind::PublicKeyOfferResend => self.profile.public_key_offer,
            TimerKind::StartSessionResend => self.profile.start_session,
            _ => self.profile.connection_establish,
        }
    }

    fn arm_resend(&mut self, kind: TimerKind) {
        self.cancel_resend();
        let task = TimeoutTask::new(kind, self.timer_tx.clone());
        self.scheduler.schedule(&task, self.resend_profile(kind).timeout);
        self.resend_task = Some(task);
    }

    fn arm_standby_wait(&mut self, wait_timeout: Duration) {
        self.cancel_standby();
        let task = TimeoutTask::new(TimerKind::StandByWait, self.timer_tx.clone());
        self.scheduler.schedule(&task, wait_timeout);
        self.standby_task = Some(task);
    }

    fn arm_connected_timers(&mut self) {
        self.last_inbound = Instant::now();

        let keep_alive = TimeoutTask::new(TimerKind::KeepAlive, self.timer_tx.clone());
        self.scheduler.schedule(&keep_alive, self.profile.keep_alive_delay);
        self.keep_alive_task = Some(keep_alive);

        let deadline = TimeoutTask::new(TimerKind::ConnectionDeadline, self.timer_tx.clone());
        self.scheduler.schedule(&deadline, self.profile.connection_timeout);
        self.deadline_task = Some(deadline);
    }

    fn cancel_resend(&mut self) {
        if let Some(task) = self.resend_task.take() {
            task.cancel();
        }
    }

    fn cancel_standby(&mut self) {
        if let Some(task) = self.standby_task.take() {
            task.cancel();
        }
    }

    fn cancel_all_timers(&mut self) {
        self.cancel_resend();
        self.cancel_standby();
        if let Some(task) = self.keep_alive_task.take() {
            task.cancel();
        }
        if let Some(task) = self.deadline_task.take() {
            task.cancel();
        }
    }

    // ------------------------------------------------------------------------------------
    // teardown and plumbing
    // ------------------------------------------------------------------------------------

    fn wind_up(&mut self, datagram: &[u8]) {
        debug!(
            "winding up session {:016x} with {:?}",
            self.session.session_id(),
            String::from_utf8_lossy(datagram)
        );
        self.send_packet(Operation::Disconnect, 0, letter::wrap(datagram));
        self.teardown(Some(datagram));
    }

    fn teardown(&mut self, datagram: Option<&[u8]>) {
        self.cancel_all_timers();
        self.session.reset();
        self.publish_stage();
        self.last_sent = None;
        self.peer_public_key = None;
        self.pre_request_re_sends = 0;
        self.receivers.broadcast_on_disconnect(datagram);
    }

    fn set_stage(&mut self, stage: Stage) {
        self.session.set_stage(stage);
        self.publish_stage();
    }

    fn publish_stage(&self) {
        self.stage_cell.store(self.session.stage().into(), Ordering::Release);
    }

    fn send_packet(&self, operation: Operation, tag: u64, letter: Vec<u8>) -> Vec<u8> {
        let packet = Packet::new(self.session.session_id(), operation, tag, letter);
        let mut buf = BytesMut::new();
        packet.ser(&mut buf);
        let frame = buf.to_vec();

        trace!(
            "sending {:?} for session {:016x} ({} bytes)",
            operation,
            packet.head.session_id,
            frame.len()
        );
        self.messenger.send(&frame);
        frame
    }
}
