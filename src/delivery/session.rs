use num_enum::{IntoPrimitive, TryFromPrimitive};
use rand::RngCore;
use tracing::debug;

/// Handshake stages, ordered and monotonic within one connection attempt. Both endpoints
///  track the same numeric stage; see the crate documentation for which role owns which
///  transition.
#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Stage {
    NotConnected = 0,
    ConnectRequestSent = 1,
    PublicKeyOffered = 2,
    SessionKeySent = 3,
    SessionVerificationSent = 4,
    ConnectionEstablishing = 5,
    Connected = 6,
}

/// Assigned once per connection attempt, when the session leaves `NotConnected`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Role {
    Requester,
    Acceptor,
}

/// One delivery instance's current connection attempt or established channel. The object
///  is reusable: teardown returns it to `NotConnected` with a freshly sampled session id
///  instead of destroying it.
pub struct Session {
    session_id: u64,
    stage: Stage,
    role: Option<Role>,
    session_key: Option<Vec<u8>>,
    pending_encrypted_session_key: Option<Vec<u8>>,
}

impl Session {
    pub fn new() -> Session {
        Session {
            session_id: rand::thread_rng().next_u64(),
            stage: Stage::NotConnected,
            role: None,
            session_key: None,
            pending_encrypted_session_key: None,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn session_key(&self) -> Option<&[u8]> {
        self.session_key.as_deref()
    }

    pub fn pending_encrypted_session_key(&self) -> Option<&[u8]> {
        self.pending_encrypted_session_key.as_deref()
    }

    pub fn set_stage(&mut self, stage: Stage) {
        debug!("session {:016x}: stage {:?} -> {:?}", self.session_id, self.stage, stage);
        self.stage = stage;
    }

    pub fn assign_role(&mut self, role: Role) {
        self.role = Some(role);
    }

    /// Adopts the session id chosen by the requester. Only valid in the bootstrap case,
    ///  before this endpoint has a role.
    pub fn adopt_session_id(&mut self, session_id: u64) {
        self.session_id = session_id;
    }

    pub fn set_session_key(&mut self, key: Vec<u8>) {
        self.session_key = Some(key);
    }

    pub fn set_pending_encrypted_session_key(&mut self, ciphertext: Vec<u8>) {
        self.pending_encrypted_session_key = Some(ciphertext);
    }

    /// Samples a new session id, guaranteed to differ from the current one.
    pub fn resample_session_id(&mut self) {
        let previous = self.session_id;
        let mut rng = rand::thread_rng();
        loop {
            self.session_id = rng.next_u64();
            if self.session_id != previous {
                break;
            }
        }
    }

    /// Teardown: back to `NotConnected` with a fresh session id. Role and key material do
    ///  not survive a reset.
    pub fn reset(&mut self) {
        self.stage = Stage::NotConnected;
        self.role = None;
        self.session_key = None;
        self.pending_encrypted_session_key = None;
        self.resample_session_id();
    }
}
