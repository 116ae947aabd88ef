//! A connection-oriented, authenticated, corruption-detecting session protocol on top of an
//!  arbitrary unreliable point-to-point byte-message transport (UDP-like channels, custom
//!  packet buses, ...).
//!
//! Two endpoints negotiate a symmetric session key through an asymmetric handshake, then
//!  exchange tagged application data with per-packet integrity checking and resend-based
//!  reliability hints.
//!
//! ## Handshake
//!
//! Roles are assigned at runtime: the *requester* initiates, the *acceptor* responds. Both
//!  endpoints track the same numeric stage; each stage transition is owned by exactly one of
//!  the two roles:
//!
//! ```ascii
//!  Requester                              Acceptor
//!      |                                      |
//!      |            not connected             | Stage 0
//!      |                                      |
//!      |           connect request            |
//!      |------------------------------------->| Stage 1
//!      |                                      |
//!      |          public key offering         |
//!      |<-------------------------------------| Stage 2
//!      |                                      |
//!      |         generate session key,        |
//!      |         encrypt with public key      |
//!      |------------------------------------->| Stage 3
//!      |                                      |
//!      |          verify session key          |
//!      |<-------------------------------------| Stage 4
//!      |                                      |
//!      |        connection established        |
//!      |------------------------------------->| Stage 5
//!      |                                      |
//!      |    connection confirm / send data    |
//!      |<-------------------------------------| Stage 6
//! ```
//!
//! Frames whose `(stage, operation)` pair is not part of the transition table are ignored,
//!  as are frames carrying a foreign session id (except the initial connect request, which
//!  is what establishes the session id on the acceptor side).
//!
//! ## Wire format
//!
//! All numbers in network byte order (BE):
//!
//! ```ascii
//!  0: head checksum (u64) - CRC-64 over bytes 8..25, i.e. exactly the head fields
//!  8: session id (u64)
//! 16: operation (u8)
//! 17: tag (u64) - application correlation id for data frames, last-known peer
//!      stage for pre-authentication recovery frames
//! 25: letter (variable) - the inner payload frame, not covered by the head checksum
//! ```
//!
//! The letter is an independently checksummed inner frame (`checksum(u64) | payload`),
//!  optionally passed as a whole through the symmetric cipher. Head and letter are separate
//!  integrity domains: a corrupt letter never invalidates an authentic head, which is what
//!  allows the receiver to answer a broken data frame with a tagged BROKEN_DATA instead of
//!  dropping it silently.
//!
//! ## Reliability
//!
//! Every phase that awaits a specific reply arms one attempt-counted resend timer on a
//!  shared tick scheduler; exhausting the budget winds the session up with a TIMEOUT
//!  datagram. Phases whose progress depends on a decision of the *peer's* application are
//!  additionally bounded by a much longer standby-wait timer which the peer can refresh
//!  with CONNECT_STANDBY / PUBLIC_KEY_STANDBY liveness pings. Corrupted frames received
//!  before authentication completes are answered with BROKEN_PRE_REQUEST, asking the peer
//!  to resend whatever frame was lost.
//!
//! All state-mutating work of one [`delivery::SecureDelivery`] - API calls, inbound frames,
//!  timer firings - is serialized onto a single event-loop task; timers and the transport
//!  only ever post messages onto that queue.

pub mod config;
pub mod crypto;
pub mod delivery;
pub mod error;
pub mod messenger;
pub mod receiver;
pub mod retry;
pub mod test_util;
pub mod wire;
