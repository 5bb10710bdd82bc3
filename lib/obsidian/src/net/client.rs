use crate::cache::ScoreCache;
use crate::net::link::Link;
use crate::net::support::{ErrorUtils, NetError};
use crate::policy::Policy;
use crate::protocol::{ClientPacket, PacketError, ServerPacket};
use crate::replay::{CompressedReplay, ReplayFile};
use crate::store::ProcessedScore;
use quartz::crypto::{self, KeyPair, SessionKeys};
use quartz::logging::{debug, warn, Logger};
use quartz::UserId;
use std::collections::VecDeque;
use std::net::{SocketAddr, TcpStream};
use std::time::Instant;

/// Client session states. `InitError` and `ConnectionError` are terminal until the
/// next `connect` call.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    LoggedIn,
    InitError,
    ConnectionError,
}

/// Asynchronous results surfaced to the application. Requests never return results
/// directly; everything arrives here, drained one at a time in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ConnectionSuccess,
    ConnectionFailure(String),
    Kicked,
    RegistrationSuccess,
    RegistrationFailure(String),
    LoginSuccess { name: String },
    LoginFailure(String),
    LogoutSuccess,
    LogoutFailure,
    DeleteAccountSuccess,
    DeleteAccountFailure(String),
    TopScores {
        level_validator: String,
        scores: Vec<ProcessedScore>,
    },
    OwnScore {
        level_validator: String,
        score: ProcessedScore,
    },
    TopScoresAndOwnScore {
        level_validator: String,
        scores: Vec<ProcessedScore>,
        own_score: Option<ProcessedScore>,
    },
}

/// Poll driven leaderboard client. Owns the socket, the session keys, the event
/// queue and the score cache; everything runs on the caller's thread via `update`.
pub struct Client {
    policy: Policy,
    log: Logger,
    state: SessionState,
    link: Option<Link<TcpStream>>,
    key_pair: Option<KeyPair>,
    session: Option<SessionKeys>,
    identity: Option<UserId>,
    login_token: Option<u64>,
    last_heartbeat: Instant,
    events: VecDeque<ClientEvent>,
    cache: ScoreCache,
}

impl Client {
    pub fn new(policy: Policy, log: Logger) -> Client {
        let cache = ScoreCache::new(policy.cache_ttl);

        Client {
            policy,
            log,
            state: SessionState::Disconnected,
            link: None,
            key_pair: None,
            session: None,
            identity: None,
            login_token: None,
            last_heartbeat: Instant::now(),
            events: VecDeque::new(),
            cache,
        }
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[inline]
    pub fn cache(&self) -> &ScoreCache {
        &self.cache
    }

    /// Next pending event, in arrival order.
    #[inline]
    pub fn poll_event(&mut self) -> Option<ClientEvent> {
        self.events.pop_front()
    }

    #[cfg(test)]
    pub(crate) fn session_keys(&self) -> Option<&SessionKeys> {
        self.session.as_ref()
    }

    /// Establishes the connection: socket connect, first heartbeat and the public
    /// key send. A fresh key pair is generated per attempt. On success the session
    /// is `Connected` and a `ConnectionSuccess` event is queued; the server's
    /// public key then arrives asynchronously and completes the key exchange.
    pub fn connect(&mut self, address: SocketAddr) {
        match self.state {
            SessionState::Connecting | SessionState::Connected | SessionState::LoggedIn => return,
            _ => (),
        }

        self.state = SessionState::Connecting;

        let key_pair = match crypto::generate_key_pair() {
            Some(key_pair) => key_pair,
            None => {
                self.state = SessionState::InitError;
                self.events
                    .push_back(ClientEvent::ConnectionFailure("key pair generation failed".into()));
                return;
            }
        };

        let stream = match TcpStream::connect_timeout(&address, self.policy.connect_timeout) {
            Ok(stream) => stream,
            Err(err) => {
                self.state = SessionState::ConnectionError;
                self.events
                    .push_back(ClientEvent::ConnectionFailure(format!("connect failed: {}", err)));
                return;
            }
        };

        if let Err(err) = stream.set_nonblocking(true) {
            self.state = SessionState::ConnectionError;
            self.events
                .push_back(ClientEvent::ConnectionFailure(format!("socket setup failed: {}", err)));
            return;
        }

        let _ = stream.set_nodelay(true);

        let mut link = Link::new(stream, self.policy.max_frame_size, self.policy.max_send_stalls);

        let handshake = link
            .send(&ClientPacket::Heartbeat.encode())
            .and_then(|_| link.send(&ClientPacket::PublicKey(key_pair.public_key).encode()));

        if handshake.has_failed() {
            self.state = SessionState::ConnectionError;
            self.events
                .push_back(ClientEvent::ConnectionFailure("handshake send failed".into()));
            return;
        }

        debug!(self.log, "connected"; "address" => %address);

        self.link = Some(link);
        self.key_pair = Some(key_pair);
        self.last_heartbeat = Instant::now();
        self.state = SessionState::Connected;
        self.events.push_back(ClientEvent::ConnectionSuccess);
    }

    /// Graceful teardown, notifying the server on a best effort basis.
    pub fn disconnect(&mut self) {
        if let Some(link) = self.link.as_mut() {
            let notice = match self.session.as_ref() {
                Some(session) => ClientPacket::Disconnect.seal(&session.transmit_key),
                None => Some(ClientPacket::Disconnect.encode()),
            };

            if let Some(bytes) = notice {
                let _ = link.send(&bytes);
            }

            link.disconnect();
        }

        self.teardown(SessionState::Disconnected);
    }

    /// One poll pass: flush pending egress, drain incoming packets, send the
    /// periodic heartbeat. Call this regularly from the application loop.
    pub fn update(&mut self, now: Instant) {
        if !self.is_online() {
            return;
        }

        self.heartbeat(now);

        if let Some(link) = self.link.as_mut() {
            if link.flush().has_failed() {
                self.fail_connection("send failed".into());
                return;
            }
        }

        while self.is_online() {
            let frame = match self.link.as_mut() {
                Some(link) => link.receive(),
                None => return,
            };

            match frame {
                Ok(frame) => self.handle_frame(&frame, now),
                Err(NetError::Wait) => break,
                Err(NetError::Fatal(kind)) => {
                    self.fail_connection(format!("connection lost: {:?}", kind));
                    break;
                }
            }
        }
    }

    /// Registration request. Accepted only while `Connected`; the outcome arrives
    /// as an event.
    pub fn try_register(&mut self, identity: UserId, name: &str, password_hash: u64) -> bool {
        if self.state != SessionState::Connected {
            return false;
        }

        self.identity = Some(identity);
        self.send_sealed(ClientPacket::Register {
            identity,
            name: name.to_string(),
            password_hash,
        })
    }

    /// Login request. Accepted only while `Connected`; a successful reply moves the
    /// session to `LoggedIn`.
    pub fn try_login(&mut self, identity: UserId, name: &str, password_hash: u64) -> bool {
        if self.state != SessionState::Connected {
            return false;
        }

        self.identity = Some(identity);
        self.send_sealed(ClientPacket::Login {
            identity,
            name: name.to_string(),
            password_hash,
        })
    }

    pub fn try_logout_from_server(&mut self) -> bool {
        if self.state != SessionState::LoggedIn {
            return false;
        }

        let identity = match self.identity {
            Some(identity) => identity,
            None => return false,
        };

        self.send_sealed(ClientPacket::Logout { identity })
    }

    pub fn try_delete_account(&mut self, identity: UserId, password_hash: u64) -> bool {
        if self.state != SessionState::Connected {
            return false;
        }

        self.send_sealed(ClientPacket::DeleteAccount {
            identity,
            password_hash,
        })
    }

    /// Requests the top scores for a level key, unless the cache still holds a
    /// fresh entry. Returns true when a request actually went out.
    pub fn try_request_top_scores(&mut self, level_validator: &str, now: Instant) -> bool {
        self.request_scores(level_validator, now, ScoreRequest::Top)
    }

    pub fn try_request_own_score(&mut self, level_validator: &str, now: Instant) -> bool {
        self.request_scores(level_validator, now, ScoreRequest::Own)
    }

    pub fn try_request_top_scores_and_own_score(&mut self, level_validator: &str, now: Instant) -> bool {
        self.request_scores(level_validator, now, ScoreRequest::Both)
    }

    /// Announces that a level run has started, establishing the server side wall
    /// clock baseline for the upcoming replay.
    pub fn report_started_game(&mut self, level_validator: &str) -> bool {
        if self.state != SessionState::LoggedIn {
            return false;
        }

        let token = match self.login_token {
            Some(token) => token,
            None => return false,
        };

        self.send_sealed(ClientPacket::StartedGame {
            token,
            level_validator: level_validator.to_string(),
        })
    }

    /// Submits a finished run for score validation. The server never acknowledges a
    /// rejected submission; an accepted one shows up in later leaderboard fetches.
    pub fn submit_replay(&mut self, replay: &ReplayFile) -> bool {
        if self.state != SessionState::LoggedIn {
            return false;
        }

        let token = match self.login_token {
            Some(token) => token,
            None => return false,
        };

        self.send_sealed(ClientPacket::Replay {
            token,
            replay: CompressedReplay::compress(replay),
        })
    }

    #[inline]
    fn is_online(&self) -> bool {
        self.state == SessionState::Connected || self.state == SessionState::LoggedIn
    }

    fn request_scores(&mut self, level_validator: &str, now: Instant, kind: ScoreRequest) -> bool {
        if self.state != SessionState::LoggedIn {
            return false;
        }

        if !self.cache.should_request(level_validator, now) {
            return false;
        }

        let token = match self.login_token {
            Some(token) => token,
            None => return false,
        };

        let packet = match kind {
            ScoreRequest::Top => ClientPacket::RequestTopScores {
                token,
                level_validator: level_validator.to_string(),
            },
            ScoreRequest::Own => ClientPacket::RequestOwnScore {
                token,
                level_validator: level_validator.to_string(),
            },
            ScoreRequest::Both => ClientPacket::RequestTopScoresAndOwnScore {
                token,
                level_validator: level_validator.to_string(),
            },
        };

        if self.send_sealed(packet) {
            self.cache.mark_requested(level_validator, now);
            true
        } else {
            false
        }
    }

    fn heartbeat(&mut self, now: Instant) {
        if now.duration_since(self.last_heartbeat) < self.policy.heartbeat_interval {
            return;
        }

        self.last_heartbeat = now;

        let bytes = match self.session.as_ref() {
            Some(session) => match ClientPacket::Heartbeat.seal(&session.transmit_key) {
                Some(bytes) => bytes,
                None => {
                    self.fail_connection("encryption failed".into());
                    return;
                }
            },
            None => ClientPacket::Heartbeat.encode(),
        };

        self.send_bytes(&bytes);
    }

    fn handle_frame(&mut self, frame: &[u8], now: Instant) {
        let receive_key = self.session.as_ref().map(|session| &session.receive_key);

        let packet = match ServerPacket::decode(frame, receive_key) {
            Ok(packet) => packet,
            Err(PacketError::Invalid(reason)) => {
                warn!(self.log, "ignoring malformed packet"; "reason" => reason);
                return;
            }
            Err(PacketError::Crypto) => {
                self.fail_connection("undecryptable packet".into());
                return;
            }
        };

        match packet {
            ServerPacket::Kick => {
                warn!(self.log, "kicked by server");
                if let Some(link) = self.link.as_mut() {
                    link.disconnect();
                }
                self.teardown(SessionState::Disconnected);
                self.events.push_back(ClientEvent::Kicked);
            }
            ServerPacket::PublicKey(server_key) => {
                let derived = match self.key_pair.as_ref() {
                    Some(key_pair) => crypto::client_session_keys(key_pair, &server_key),
                    None => None,
                };

                match derived {
                    Some(session) => {
                        debug!(self.log, "session keys derived");
                        self.session = Some(session);
                    }
                    None => self.fail_connection("session key derivation failed".into()),
                }
            }
            ServerPacket::RegistrationSuccess => self.events.push_back(ClientEvent::RegistrationSuccess),
            ServerPacket::RegistrationFailure { error } => {
                self.events.push_back(ClientEvent::RegistrationFailure(error))
            }
            ServerPacket::LoginSuccess { token, name } => {
                self.login_token = Some(token);
                if self.state == SessionState::Connected {
                    self.state = SessionState::LoggedIn;
                }
                self.events.push_back(ClientEvent::LoginSuccess { name });
            }
            ServerPacket::LoginFailure { error } => self.events.push_back(ClientEvent::LoginFailure(error)),
            ServerPacket::LogoutSuccess => {
                self.login_token = None;
                if self.state == SessionState::LoggedIn {
                    self.state = SessionState::Connected;
                }
                self.events.push_back(ClientEvent::LogoutSuccess);
            }
            ServerPacket::LogoutFailure => self.events.push_back(ClientEvent::LogoutFailure),
            ServerPacket::DeleteAccountSuccess => {
                self.login_token = None;
                if self.state == SessionState::LoggedIn {
                    self.state = SessionState::Connected;
                }
                self.events.push_back(ClientEvent::DeleteAccountSuccess);
            }
            ServerPacket::DeleteAccountFailure { error } => {
                self.events.push_back(ClientEvent::DeleteAccountFailure(error))
            }
            ServerPacket::TopScores {
                level_validator,
                scores,
            } => {
                self.cache.received_top_scores(&level_validator, scores.clone(), now);
                self.events.push_back(ClientEvent::TopScores {
                    level_validator,
                    scores,
                });
            }
            ServerPacket::OwnScore {
                level_validator,
                score,
            } => {
                self.cache.received_own_score(&level_validator, Some(score.clone()), now);
                self.events.push_back(ClientEvent::OwnScore {
                    level_validator,
                    score,
                });
            }
            ServerPacket::TopScoresAndOwnScore {
                level_validator,
                scores,
                own_score,
            } => {
                self.cache.received_top_scores(&level_validator, scores.clone(), now);
                self.cache.received_own_score(&level_validator, own_score.clone(), now);
                self.events.push_back(ClientEvent::TopScoresAndOwnScore {
                    level_validator,
                    scores,
                    own_score,
                });
            }
            ServerPacket::Encrypted(_) => {
                // The decoder unwraps envelopes; a nested one is a peer bug
                warn!(self.log, "ignoring doubly wrapped packet");
            }
        }
    }

    fn send_sealed(&mut self, packet: ClientPacket) -> bool {
        let session = match self.session.as_ref() {
            Some(session) => session,
            None => {
                debug!(self.log, "request dropped, key exchange not complete");
                return false;
            }
        };

        let bytes = match packet.seal(&session.transmit_key) {
            Some(bytes) => bytes,
            None => {
                self.fail_connection("encryption failed".into());
                return false;
            }
        };

        self.send_bytes(&bytes)
    }

    fn send_bytes(&mut self, bytes: &[u8]) -> bool {
        let link = match self.link.as_mut() {
            Some(link) => link,
            None => return false,
        };

        match link.send(bytes) {
            Ok(()) => true,
            Err(NetError::Wait) => {
                debug!(self.log, "request dropped, send backlog full");
                false
            }
            Err(NetError::Fatal(kind)) => {
                self.fail_connection(format!("send failed: {:?}", kind));
                false
            }
        }
    }

    fn fail_connection(&mut self, reason: String) {
        warn!(self.log, "connection failed"; "reason" => &reason);

        if let Some(link) = self.link.as_mut() {
            link.disconnect();
        }

        self.teardown(SessionState::ConnectionError);
        self.events.push_back(ClientEvent::ConnectionFailure(reason));
    }

    fn teardown(&mut self, state: SessionState) {
        self.link = None;
        self.key_pair = None;
        self.session = None;
        self.login_token = None;
        self.state = state;
    }
}

enum ScoreRequest {
    Top,
    Own,
    Both,
}

#[cfg(test)]
mod tests {
    use super::*;
    use quartz::logging;
    use std::net::TcpListener;

    fn client() -> Client {
        Client::new(Policy::default(), logging::null())
    }

    #[test]
    fn test_requests_rejected_while_disconnected() {
        let mut client = client();

        assert!(!client.try_register(1, "Alice", 2));
        assert!(!client.try_login(1, "Alice", 2));
        assert!(!client.try_logout_from_server());
        assert!(!client.try_request_top_scores("L1_m_1.0", Instant::now()));
        assert_eq!(client.state(), SessionState::Disconnected);
        assert_eq!(client.poll_event(), None);
    }

    #[test]
    fn test_connect_failure_is_terminal_error_state() {
        let mut client = client();

        // Nothing listens on this port; connect_timeout fails fast on loopback
        let unused = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        client.connect(unused);

        assert_eq!(client.state(), SessionState::ConnectionError);

        match client.poll_event() {
            Some(ClientEvent::ConnectionFailure(reason)) => assert!(reason.contains("connect failed")),
            other => panic!("Unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_connect_reaches_connected_and_queues_success() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = client();

        client.connect(listener.local_addr().unwrap());

        assert_eq!(client.state(), SessionState::Connected);
        assert_eq!(client.poll_event(), Some(ClientEvent::ConnectionSuccess));
        assert_eq!(client.poll_event(), None);
    }

    #[test]
    fn test_requests_before_key_exchange_are_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = client();

        client.connect(listener.local_addr().unwrap());

        // Connected, but no server public key yet, so nothing can be sealed
        assert!(!client.try_register(1, "Alice", 2));
        assert_eq!(client.state(), SessionState::Connected);
    }

    #[test]
    fn test_disconnect_resets_state() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = client();

        client.connect(listener.local_addr().unwrap());
        client.disconnect();

        assert_eq!(client.state(), SessionState::Disconnected);

        // A fresh connect attempt is allowed again
        client.connect(listener.local_addr().unwrap());
        assert_eq!(client.state(), SessionState::Connected);
    }

    #[test]
    fn test_connect_ignored_while_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = client();

        client.connect(listener.local_addr().unwrap());
        assert_eq!(client.poll_event(), Some(ClientEvent::ConnectionSuccess));

        client.connect(listener.local_addr().unwrap());
        assert_eq!(client.state(), SessionState::Connected);
        assert_eq!(client.poll_event(), None);
    }

    #[test]
    fn test_events_drain_in_arrival_order() {
        let mut client = client();

        client.events.push_back(ClientEvent::RegistrationSuccess);
        client.events.push_back(ClientEvent::LoginFailure("nope".into()));
        client.events.push_back(ClientEvent::LogoutSuccess);

        assert_eq!(client.poll_event(), Some(ClientEvent::RegistrationSuccess));
        assert_eq!(client.poll_event(), Some(ClientEvent::LoginFailure("nope".into())));
        assert_eq!(client.poll_event(), Some(ClientEvent::LogoutSuccess));
        assert_eq!(client.poll_event(), None);
    }
}
