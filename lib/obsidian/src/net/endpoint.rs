use crate::arbiter::{self, ReplayVerdict};
use crate::net::link::Link;
use crate::net::support::{ErrorUtils, FaultKind, NetError, NetResult};
use crate::protocol::{ClientPacket, PacketError, ServerPacket};
use crate::sim::{GameSimulation, LevelCatalog};
use crate::store::{LoginToken, Score, Store, User};
use crate::policy::Policy;
use indexmap::IndexSet;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use quartz::crypto::{self, KeyPair, PublicKey, SessionKeys};
use quartz::logging::{debug, info, warn, Logger};
use quartz::time::timestamp_secs;
use quartz::UserId;
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::Receiver;
use std::time::Instant;

const LISTENER_TOKEN: Token = Token(0);

/// Everything the server needs besides sockets, built once at startup and threaded
/// through explicitly. No process wide statics.
pub struct ServerContext {
    pub store: Box<dyn Store>,
    pub sim: Box<dyn GameSimulation>,
    pub catalog: Box<dyn LevelCatalog>,
    pub policy: Policy,
    pub log: Logger,
}

/// Wall clock baseline recorded when a connection announces a level start. Consumed
/// by the replay for that same level.
pub struct GameStatus {
    pub started_at: Instant,
    pub level_validator: String,
}

/// Login state bound to one connection. The token here is what score requests are
/// checked against.
pub struct LoginData {
    pub identity: UserId,
    pub name: String,
    pub token: u64,
}

struct ConnectedClient {
    link: Link<TcpStream>,
    peer: SocketAddr,
    last_activity: Instant,
    consecutive_failures: u32,
    client_public_key: Option<PublicKey>,
    session: Option<SessionKeys>,
    login: Option<LoginData>,
    game_status: Option<GameStatus>,
    must_disconnect: bool,
    kick_pending: bool,
}

impl ConnectedClient {
    fn new(link: Link<TcpStream>, peer: SocketAddr, now: Instant) -> ConnectedClient {
        ConnectedClient {
            link,
            peer,
            last_activity: now,
            consecutive_failures: 0,
            client_public_key: None,
            session: None,
            login: None,
            game_status: None,
            must_disconnect: false,
            kick_pending: false,
        }
    }

    #[inline]
    fn token_matches(&self, token: u64) -> bool {
        match self.login.as_ref() {
            Some(login) => login.token == token,
            None => false,
        }
    }
}

/// The leaderboard server: accepts connections, multiplexes all client sockets on
/// one readiness poll, decodes and dispatches packets, and purges idle or failed
/// connections. Everything runs on the calling thread; the only other thread in the
/// system is whatever feeds the control channel.
pub struct Endpoint {
    ctx: ServerContext,
    key_pair: KeyPair,
    poll: Poll,
    events: Events,
    listener: TcpListener,
    clients: Vec<Option<ConnectedClient>>,
    free: Vec<usize>,
    live: IndexSet<usize>,
    control: Option<Receiver<String>>,
    verbose: bool,
    last_token_purge: Instant,
}

impl Endpoint {
    pub fn new(address: &str, ctx: ServerContext) -> NetResult<Endpoint> {
        let address: SocketAddr = address.parse()?;

        let mut listener = TcpListener::bind(address)?;
        let poll = Poll::new()?;

        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let key_pair = match crypto::generate_key_pair() {
            Some(key_pair) => key_pair,
            None => return Err(NetError::Fatal(FaultKind::Crypto)),
        };

        info!(
            ctx.log,
            "server listening";
            "address" => %listener.local_addr()?,
            "public_key" => base64::encode(&key_pair.public_key)
        );

        Ok(Endpoint {
            ctx,
            key_pair,
            poll,
            events: Events::with_capacity(8192),
            listener,
            clients: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            control: None,
            verbose: false,
            last_token_purge: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> NetResult<SocketAddr> {
        self.listener.local_addr().map_err(Into::into)
    }

    /// Attaches the administrative control channel. Lines arriving here are
    /// operator commands, drained once per loop iteration.
    pub fn set_control(&mut self, control: Receiver<String>) {
        self.control = Some(control);
    }

    /// Direct access to the persistent store collaborator.
    pub fn store_mut(&mut self) -> &mut dyn Store {
        self.ctx.store.as_mut()
    }

    /// Runs the endpoint forever. Each iteration is one `pump`.
    pub fn run(&mut self) {
        loop {
            self.pump(Instant::now());
        }
    }

    /// One loop iteration: wait for readiness (bounded, so maintenance runs even
    /// with no traffic), accept and service ready sockets, drain operator commands,
    /// flush egress and purge dead connections.
    pub fn pump(&mut self, now: Instant) {
        if let Err(err) = self.poll.poll(&mut self.events, Some(self.ctx.policy.poll_timeout)) {
            if err.kind() != io::ErrorKind::Interrupted {
                warn!(self.ctx.log, "poll failed"; "error" => %err);
            }
            return;
        }

        let ready: Vec<Token> = self.events.iter().map(|event| event.token()).collect();

        for token in ready {
            match token {
                LISTENER_TOKEN => self.accept_clients(now),
                Token(raw) => self.service_client(raw - 1, now),
            }
        }

        self.drain_control();
        self.flush_clients();
        self.purge_tokens(now);
        self.purge_clients(now);
    }

    /// Drain the accept queue. The readiness is edge triggered, so stopping short
    /// of `WouldBlock` could strand queued connections until the next dial-in.
    fn accept_clients(&mut self, now: Instant) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let id = self.allocate_slot();

                    let registered = self.poll.registry().register(
                        &mut stream,
                        Token(id + 1),
                        Interest::READABLE,
                    );

                    if let Err(err) = registered {
                        warn!(self.ctx.log, "client registration failed"; "peer" => %peer, "error" => %err);
                        self.free.push(id);
                        continue;
                    }

                    let link = Link::new(
                        stream,
                        self.ctx.policy.max_frame_size,
                        self.ctx.policy.max_send_stalls,
                    );

                    self.clients[id] = Some(ConnectedClient::new(link, peer, now));
                    self.live.insert(id);

                    info!(self.ctx.log, "client accepted"; "id" => id, "peer" => %peer);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(self.ctx.log, "accept failed"; "error" => %err);
                    break;
                }
            }
        }
    }

    fn allocate_slot(&mut self) -> usize {
        match self.free.pop() {
            Some(id) => id,
            None => {
                self.clients.push(None);
                self.clients.len() - 1
            }
        }
    }

    /// Service one ready client socket: pull frames until `Wait`, dispatching each.
    /// A pass that produces no dispatched packet counts against the consecutive
    /// failure budget; fatal stream or crypto errors mark the client for removal.
    fn service_client(&mut self, id: usize, now: Instant) {
        let mut client = match self.clients.get_mut(id).and_then(Option::take) {
            Some(client) => client,
            None => return,
        };

        let mut received = false;

        while !client.must_disconnect {
            match client.link.receive() {
                Ok(frame) => {
                    received = true;
                    self.dispatch_frame(&mut client, id, &frame, now);
                }
                Err(NetError::Wait) => break,
                Err(NetError::Fatal(kind)) => {
                    if self.verbose {
                        debug!(self.ctx.log, "receive failed"; "id" => id, "kind" => ?kind);
                    }
                    client.must_disconnect = true;
                }
            }
        }

        // A readable socket that yields no complete packet counts against the
        // failure budget; invalid packets were already counted by the dispatch
        if !received && !client.must_disconnect {
            client.consecutive_failures += 1;
        }

        self.clients[id] = Some(client);
    }

    /// Decode and dispatch one frame.
    fn dispatch_frame(&mut self, client: &mut ConnectedClient, id: usize, frame: &[u8], now: Instant) {
        let receive_key = client.session.as_ref().map(|session| &session.receive_key);

        let packet = match ClientPacket::decode(frame, receive_key) {
            Ok(packet) => packet,
            Err(PacketError::Invalid(reason)) => {
                warn!(self.ctx.log, "invalid packet"; "id" => id, "reason" => reason);
                client.consecutive_failures += 1;
                return;
            }
            Err(PacketError::Crypto) => {
                warn!(self.ctx.log, "undecryptable packet"; "id" => id);
                client.must_disconnect = true;
                return;
            }
        };

        client.consecutive_failures = 0;
        client.last_activity = now;

        if self.verbose {
            debug!(self.ctx.log, "dispatch"; "id" => id, "packet" => packet_name(&packet));
        }

        match packet {
            ClientPacket::Heartbeat => (),
            ClientPacket::Disconnect => {
                client.must_disconnect = true;
            }
            ClientPacket::PublicKey(client_key) => {
                client.client_public_key = Some(client_key);

                match crypto::server_session_keys(&self.key_pair, &client_key) {
                    Some(session) => {
                        client.session = Some(session);
                        // Public keys are not secret; the reply goes out in the clear
                        self.send_plain(client, ServerPacket::PublicKey(self.key_pair.public_key));
                    }
                    None => {
                        warn!(self.ctx.log, "session key derivation failed"; "id" => id);
                        client.must_disconnect = true;
                    }
                }
            }
            ClientPacket::Register {
                identity,
                name,
                password_hash,
            } => {
                let reply = self.process_register(identity, name, password_hash);
                self.send_to(client, reply);
            }
            ClientPacket::Login {
                identity,
                name,
                password_hash,
            } => match self.process_login(identity, &name) {
                Ok(user) if user.password_hash != password_hash => {
                    self.send_to(
                        client,
                        ServerPacket::LoginFailure {
                            error: "password mismatch".into(),
                        },
                    );
                }
                Ok(user) => {
                    // Single session per account: cut any other live session first
                    self.evict_identity(identity);

                    let token = crypto::random_u64();
                    self.ctx.store.replace_token(LoginToken {
                        identity,
                        token,
                        issued_at: timestamp_secs(),
                    });

                    info!(self.ctx.log, "login"; "id" => id, "identity" => identity, "name" => &user.name);

                    client.login = Some(LoginData {
                        identity,
                        name: user.name.clone(),
                        token,
                    });

                    self.send_to(
                        client,
                        ServerPacket::LoginSuccess {
                            token,
                            name: user.name,
                        },
                    );
                }
                Err(error) => self.send_to(client, ServerPacket::LoginFailure { error }),
            },
            ClientPacket::Logout { identity } => {
                let reply = match client.login.as_ref() {
                    Some(login) if login.identity == identity => {
                        self.ctx.store.revoke_tokens(identity);
                        client.login = None;
                        info!(self.ctx.log, "logout"; "id" => id, "identity" => identity);
                        ServerPacket::LogoutSuccess
                    }
                    _ => ServerPacket::LogoutFailure,
                };

                self.send_to(client, reply);
            }
            ClientPacket::DeleteAccount {
                identity,
                password_hash,
            } => {
                let reply = match self.ctx.store.user_by_identity(identity) {
                    None => ServerPacket::DeleteAccountFailure {
                        error: "unknown identity".into(),
                    },
                    Some(user) if user.password_hash != password_hash => ServerPacket::DeleteAccountFailure {
                        error: "password mismatch".into(),
                    },
                    Some(_) => {
                        self.ctx.store.revoke_tokens(identity);
                        self.ctx.store.remove_user(identity);
                        self.evict_identity(identity);

                        if let Some(login) = client.login.as_ref() {
                            if login.identity == identity {
                                client.login = None;
                            }
                        }

                        info!(self.ctx.log, "account deleted"; "id" => id, "identity" => identity);
                        ServerPacket::DeleteAccountSuccess
                    }
                };

                self.send_to(client, reply);
            }
            ClientPacket::RequestTopScores {
                token,
                level_validator,
            } => {
                if !client.token_matches(token) {
                    warn!(self.ctx.log, "score request with bad token"; "id" => id);
                    return;
                }

                let scores = self
                    .ctx
                    .store
                    .top_scores(&level_validator, self.ctx.policy.top_scores_limit);

                self.send_to(
                    client,
                    ServerPacket::TopScores {
                        level_validator,
                        scores,
                    },
                );
            }
            ClientPacket::RequestOwnScore {
                token,
                level_validator,
            } => {
                if !client.token_matches(token) {
                    warn!(self.ctx.log, "score request with bad token"; "id" => id);
                    return;
                }

                let identity = match client.login.as_ref() {
                    Some(login) => login.identity,
                    None => return,
                };

                if let Some(score) = self.ctx.store.own_score(&level_validator, identity) {
                    self.send_to(
                        client,
                        ServerPacket::OwnScore {
                            level_validator,
                            score,
                        },
                    );
                }
            }
            ClientPacket::RequestTopScoresAndOwnScore {
                token,
                level_validator,
            } => {
                if !client.token_matches(token) {
                    warn!(self.ctx.log, "score request with bad token"; "id" => id);
                    return;
                }

                let identity = match client.login.as_ref() {
                    Some(login) => login.identity,
                    None => return,
                };

                let scores = self
                    .ctx
                    .store
                    .top_scores(&level_validator, self.ctx.policy.top_scores_limit);
                let own_score = self.ctx.store.own_score(&level_validator, identity);

                self.send_to(
                    client,
                    ServerPacket::TopScoresAndOwnScore {
                        level_validator,
                        scores,
                        own_score,
                    },
                );
            }
            ClientPacket::StartedGame {
                token,
                level_validator,
            } => {
                if !client.token_matches(token) {
                    warn!(self.ctx.log, "started game with bad token"; "id" => id);
                    return;
                }

                if self.verbose {
                    debug!(self.ctx.log, "game started"; "id" => id, "validator" => &level_validator);
                }

                client.game_status = Some(GameStatus {
                    started_at: now,
                    level_validator,
                });
            }
            ClientPacket::Replay { token, replay } => {
                if !client.token_matches(token) {
                    warn!(self.ctx.log, "replay with bad token"; "id" => id);
                    return;
                }

                self.process_replay(client, id, &replay, now);
            }
            ClientPacket::Encrypted(_) => {
                // The decoder unwraps envelopes; a nested one is a peer bug
                warn!(self.ctx.log, "doubly wrapped packet"; "id" => id);
            }
        }
    }

    fn process_register(&mut self, identity: UserId, name: String, password_hash: u64) -> ServerPacket {
        if name.len() > self.ctx.policy.max_name_length {
            return ServerPacket::RegistrationFailure {
                error: "name too long".into(),
            };
        }

        if self.ctx.store.identity_registered(identity) {
            return ServerPacket::RegistrationFailure {
                error: "identity already registered".into(),
            };
        }

        if self.ctx.store.name_taken(&name) {
            return ServerPacket::RegistrationFailure {
                error: "name already taken".into(),
            };
        }

        info!(self.ctx.log, "registered"; "identity" => identity, "name" => &name);

        self.ctx.store.add_user(User {
            identity,
            name,
            password_hash,
        });

        ServerPacket::RegistrationSuccess
    }

    /// Login validation short of the password check, which the caller performs so
    /// the error ordering matches the protocol contract.
    fn process_login(&mut self, identity: UserId, name: &str) -> Result<User, String> {
        if name.len() > self.ctx.policy.max_name_length {
            return Err("name too long".into());
        }

        let user = match self.ctx.store.user_by_identity(identity) {
            Some(user) => user,
            None => return Err("unknown identity".into()),
        };

        if user.name != name {
            if !self.ctx.store.name_taken(name) {
                return Err("unknown name".into());
            }
            return Err("identity and name mismatch".into());
        }

        Ok(user)
    }

    /// The anti-cheat path. Rejections are logged and silently dropped; replying
    /// would leak the detection threshold to the client.
    fn process_replay(
        &mut self,
        client: &mut ConnectedClient,
        id: usize,
        replay: &crate::replay::CompressedReplay,
        now: Instant,
    ) {
        let status = match client.game_status.take() {
            Some(status) => status,
            None => {
                warn!(self.ctx.log, "replay without started game"; "id" => id);
                return;
            }
        };

        let identity = match client.login.as_ref() {
            Some(login) => login.identity,
            None => return,
        };

        let file = match replay.decompress() {
            Ok(file) => file,
            Err(err) => {
                warn!(self.ctx.log, "replay rejected"; "id" => id, "reason" => ?err);
                return;
            }
        };

        let wall_elapsed = now.duration_since(status.started_at).as_secs_f64();

        let verdict = arbiter::judge_replay(
            self.ctx.sim.as_ref(),
            self.ctx.catalog.as_ref(),
            &file,
            &status.level_validator,
            wall_elapsed,
            self.ctx.policy.score_tolerance_secs,
        );

        match verdict {
            ReplayVerdict::Accepted(value) => {
                info!(
                    self.ctx.log,
                    "score recorded";
                    "id" => id,
                    "identity" => identity,
                    "validator" => &status.level_validator,
                    "value" => value
                );

                self.ctx.store.record_score(Score {
                    level_validator: status.level_validator,
                    timestamp: timestamp_secs(),
                    identity,
                    value,
                });
            }
            ReplayVerdict::Rejected(reason) => {
                warn!(
                    self.ctx.log,
                    "replay rejected";
                    "id" => id,
                    "identity" => identity,
                    "reason" => reason.as_str(),
                    "wall_elapsed" => wall_elapsed
                );
            }
        }
    }

    /// Cut every other live session logged in under this identity.
    fn evict_identity(&mut self, identity: UserId) {
        for slot in self.clients.iter_mut() {
            if let Some(other) = slot.as_mut() {
                let held = match other.login.as_ref() {
                    Some(login) => login.identity == identity,
                    None => false,
                };

                if held {
                    other.login = None;
                    other.must_disconnect = true;
                    other.kick_pending = true;
                }
            }
        }
    }

    /// Sealed when the connection has session keys, plaintext before that.
    fn send_to(&self, client: &mut ConnectedClient, packet: ServerPacket) {
        let bytes = match client.session.as_ref() {
            Some(session) => match packet.seal(&session.transmit_key) {
                Some(bytes) => bytes,
                None => {
                    warn!(self.ctx.log, "encryption failed"; "peer" => %client.peer);
                    client.must_disconnect = true;
                    return;
                }
            },
            None => packet.encode(),
        };

        self.send_bytes(client, &bytes);
    }

    fn send_plain(&self, client: &mut ConnectedClient, packet: ServerPacket) {
        self.send_bytes(client, &packet.encode());
    }

    fn send_bytes(&self, client: &mut ConnectedClient, bytes: &[u8]) {
        match client.link.send(bytes) {
            Ok(()) => (),
            Err(NetError::Wait) => {
                warn!(self.ctx.log, "reply dropped, send backlog full"; "peer" => %client.peer);
            }
            Err(NetError::Fatal(_)) => {
                client.must_disconnect = true;
            }
        }
    }

    fn drain_control(&mut self) {
        let commands: Vec<String> = match self.control.as_ref() {
            Some(control) => control.try_iter().collect(),
            None => return,
        };

        for command in commands {
            self.execute_command(command.trim());
        }
    }

    /// Operator commands from the local control channel: `verbose true|false` and
    /// `db exec <query>`. Not part of the client protocol.
    pub fn execute_command(&mut self, command: &str) {
        if command.is_empty() {
            return;
        }

        let mut parts = command.splitn(3, ' ');

        match (parts.next(), parts.next()) {
            (Some("verbose"), Some("true")) => {
                self.verbose = true;
                info!(self.ctx.log, "verbose logging on");
            }
            (Some("verbose"), Some("false")) => {
                self.verbose = false;
                info!(self.ctx.log, "verbose logging off");
            }
            (Some("db"), Some("exec")) => match parts.next() {
                Some(query) => {
                    let result = self.ctx.store.exec_raw(query);
                    info!(self.ctx.log, "db exec"; "query" => query, "result" => result);
                }
                None => warn!(self.ctx.log, "usage: db exec <query>"),
            },
            _ => warn!(self.ctx.log, "unknown command"; "command" => command),
        }
    }

    fn flush_clients(&mut self) {
        let ids: Vec<usize> = self.live.iter().copied().collect();

        for id in ids {
            if let Some(client) = self.clients[id].as_mut() {
                if client.link.flush().has_failed() {
                    client.must_disconnect = true;
                }
            }
        }
    }

    /// Slow periodic sweep: drop stale login tokens from the store and cut any
    /// connected client still holding one.
    fn purge_tokens(&mut self, now: Instant) {
        if now.duration_since(self.last_token_purge) < self.ctx.policy.token_purge_interval {
            return;
        }

        self.last_token_purge = now;

        let stale = self.ctx.store.purge_stale_tokens(self.ctx.policy.token_max_age_secs);

        if stale.is_empty() {
            return;
        }

        info!(self.ctx.log, "stale tokens purged"; "count" => stale.len());

        for identity in stale {
            self.evict_identity(identity);
        }
    }

    fn purge_clients(&mut self, now: Instant) {
        let ids: Vec<usize> = self.live.iter().copied().collect();

        for id in ids {
            let (drop_client, kick) = match self.clients[id].as_ref() {
                Some(client) => {
                    if client.must_disconnect {
                        (true, client.kick_pending)
                    } else if client.consecutive_failures >= self.ctx.policy.max_consecutive_failures {
                        (true, true)
                    } else if now.duration_since(client.last_activity) >= self.ctx.policy.idle_timeout {
                        (true, true)
                    } else {
                        (false, false)
                    }
                }
                None => (false, false),
            };

            if drop_client {
                self.remove_client(id, kick);
            }
        }
    }

    fn remove_client(&mut self, id: usize, kick: bool) {
        let mut client = match self.clients[id].take() {
            Some(client) => client,
            None => return,
        };

        if kick {
            self.send_to(&mut client, ServerPacket::Kick);
            let _ = client.link.flush();
        }

        let _ = self.poll.registry().deregister(client.link.stream_mut());
        client.link.disconnect();

        self.live.swap_remove(&id);
        self.free.push(id);

        info!(self.ctx.log, "client dropped"; "id" => id, "peer" => %client.peer, "kicked" => kick);
    }
}

fn packet_name(packet: &ClientPacket) -> &'static str {
    match packet {
        ClientPacket::Heartbeat => "heartbeat",
        ClientPacket::Disconnect => "disconnect",
        ClientPacket::PublicKey(_) => "public_key",
        ClientPacket::Register { .. } => "register",
        ClientPacket::Login { .. } => "login",
        ClientPacket::Logout { .. } => "logout",
        ClientPacket::DeleteAccount { .. } => "delete_account",
        ClientPacket::RequestTopScores { .. } => "request_top_scores",
        ClientPacket::RequestOwnScore { .. } => "request_own_score",
        ClientPacket::RequestTopScoresAndOwnScore { .. } => "request_top_scores_and_own_score",
        ClientPacket::StartedGame { .. } => "started_game",
        ClientPacket::Replay { .. } => "replay",
        ClientPacket::Encrypted(_) => "encrypted",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::client::{Client, ClientEvent, SessionState};
    use crate::replay::{ReplayData, ReplayFile, REPLAY_FORMAT_VERSION};
    use crate::sim::{ClaimedScoreSimulation, LevelRecord, StaticCatalog};
    use crate::store::MemoryStore;
    use quartz::logging;
    use std::io::{Read, Write};
    use std::time::Duration;

    const ALICE: UserId = 7001;
    const ALICE_HASH: u64 = 0x5eed_cafe;
    const VALIDATOR: &str = "L1_m_1.0";

    fn test_policy() -> Policy {
        Policy {
            poll_timeout: Duration::from_millis(2),
            ..Policy::default()
        }
    }

    fn test_endpoint(policy: Policy) -> Endpoint {
        let ctx = ServerContext {
            store: Box::new(MemoryStore::new()),
            sim: Box::new(ClaimedScoreSimulation),
            catalog: Box::new(StaticCatalog::new(vec![LevelRecord {
                pack_id: "base".into(),
                level_id: "L1".into(),
                scored: true,
            }])),
            policy,
            log: logging::null(),
        };

        Endpoint::new("127.0.0.1:0", ctx).unwrap()
    }

    fn sample_replay(claimed_score: f64) -> ReplayFile {
        ReplayFile {
            format_version: REPLAY_FORMAT_VERSION,
            player_name: "Alice".into(),
            seed: 1234,
            data: ReplayData::new(),
            pack_id: "base".into(),
            level_id: "L1".into(),
            music_start_offset: 0.0,
            first_play: true,
            difficulty_mult: 1.0,
            claimed_score,
        }
    }

    struct Harness {
        endpoint: Endpoint,
        client: Client,
        events: Vec<ClientEvent>,
    }

    impl Harness {
        fn new() -> Harness {
            let endpoint = test_endpoint(test_policy());

            Harness {
                endpoint,
                client: Client::new(test_policy(), logging::null()),
                events: Vec::new(),
            }
        }

        fn connect(&mut self) {
            let address = self.endpoint.local_addr().unwrap();
            self.client.connect(address);
            assert_eq!(self.client.state(), SessionState::Connected);
        }

        fn pump(&mut self) {
            self.endpoint.pump(Instant::now());
            self.client.update(Instant::now());

            while let Some(event) = self.client.poll_event() {
                self.events.push(event);
            }
        }

        fn pump_until<F: Fn(&Harness) -> bool>(&mut self, condition: F) {
            for _ in 0..500 {
                self.pump();
                if condition(self) {
                    return;
                }
            }

            panic!("Condition not reached; events so far: {:?}", self.events);
        }

        fn pump_until_event<F: Fn(&ClientEvent) -> bool>(&mut self, matcher: F) {
            self.pump_until(|harness| harness.events.iter().any(|event| matcher(event)));
        }

        fn handshake(&mut self) {
            self.connect();
            self.pump_until(|harness| harness.client.session_keys().is_some());
        }

        fn login(&mut self) {
            self.handshake();

            assert!(self.client.try_register(ALICE, "Alice", ALICE_HASH));
            self.pump_until_event(|event| *event == ClientEvent::RegistrationSuccess);

            assert!(self.client.try_login(ALICE, "Alice", ALICE_HASH));
            self.pump_until(|harness| harness.client.state() == SessionState::LoggedIn);
        }
    }

    #[test]
    fn test_end_to_end_register_login_replay_scores() {
        let mut harness = Harness::new();
        harness.handshake();

        // No score request can go out before login succeeds
        assert!(!harness.client.try_request_top_scores(VALIDATOR, Instant::now()));

        assert!(harness.client.try_register(ALICE, "Alice", ALICE_HASH));
        harness.pump_until_event(|event| *event == ClientEvent::RegistrationSuccess);

        assert!(harness.client.try_login(ALICE, "Alice", ALICE_HASH));
        harness.pump_until(|harness| harness.client.state() == SessionState::LoggedIn);

        harness
            .events
            .iter()
            .find(|event| matches!(event, ClientEvent::LoginSuccess { name } if name == "Alice"))
            .expect("login success event");

        // Play a short run; the trusting simulation returns the claimed score,
        // which must land within tolerance of the wall clock elapsed (near zero)
        assert!(harness.client.report_started_game(VALIDATOR));
        harness.pump();

        assert!(harness.client.submit_replay(&sample_replay(0.25)));
        harness.pump();

        assert!(harness
            .client
            .try_request_top_scores_and_own_score(VALIDATOR, Instant::now()));

        harness.pump_until_event(|event| matches!(event, ClientEvent::TopScoresAndOwnScore { .. }));

        let event = harness
            .events
            .iter()
            .find(|event| matches!(event, ClientEvent::TopScoresAndOwnScore { .. }))
            .unwrap();

        match event {
            ClientEvent::TopScoresAndOwnScore {
                level_validator,
                scores,
                own_score,
            } => {
                assert_eq!(level_validator, VALIDATOR);
                assert_eq!(scores.len(), 1);
                assert_eq!(scores[0].position, 1);
                assert_eq!(scores[0].user_name, "Alice");
                assert_eq!(scores[0].value, 0.25);
                assert_eq!(own_score.as_ref().unwrap().position, 1);
            }
            _ => unreachable!(),
        }

        // Exactly one row persisted
        assert!(harness
            .endpoint
            .store_mut()
            .exec_raw(&format!("scores {}", VALIDATOR))
            .starts_with("1 rows"));
    }

    #[test]
    fn test_out_of_tolerance_replay_is_silently_dropped() {
        let mut harness = Harness::new();
        harness.login();

        assert!(harness.client.report_started_game(VALIDATOR));
        harness.pump();

        // Claims a 100 second run that took near zero wall time
        assert!(harness.client.submit_replay(&sample_replay(100.0)));
        harness.pump();
        harness.pump();

        assert!(harness
            .endpoint
            .store_mut()
            .exec_raw(&format!("scores {}", VALIDATOR))
            .starts_with("0 rows"));

        // The client saw no rejection of any kind
        assert!(!harness
            .events
            .iter()
            .any(|event| matches!(event, ClientEvent::ConnectionFailure(_) | ClientEvent::Kicked)));
    }

    #[test]
    fn test_replay_without_started_game_is_dropped() {
        let mut harness = Harness::new();
        harness.login();

        assert!(harness.client.submit_replay(&sample_replay(0.1)));
        harness.pump();
        harness.pump();

        assert!(harness
            .endpoint
            .store_mut()
            .exec_raw(&format!("scores {}", VALIDATOR))
            .starts_with("0 rows"));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut harness = Harness::new();
        harness.login();

        // Same identity again, from a second connection
        let mut other = Client::new(test_policy(), logging::null());
        other.connect(harness.endpoint.local_addr().unwrap());

        for _ in 0..500 {
            harness.endpoint.pump(Instant::now());
            other.update(Instant::now());
            if other.session_keys().is_some() {
                break;
            }
        }

        assert!(other.try_register(ALICE, "Someone", 1));

        let mut failure = None;
        for _ in 0..500 {
            harness.endpoint.pump(Instant::now());
            other.update(Instant::now());

            if let Some(ClientEvent::RegistrationFailure(error)) = other.poll_event() {
                failure = Some(error);
                break;
            }
        }

        assert_eq!(failure.unwrap(), "identity already registered");
    }

    #[test]
    fn test_concurrent_sessions_have_distinct_keys() {
        let mut harness = Harness::new();
        let address = harness.endpoint.local_addr().unwrap();

        let mut first = Client::new(test_policy(), logging::null());
        let mut second = Client::new(test_policy(), logging::null());

        first.connect(address);
        second.connect(address);

        for _ in 0..500 {
            harness.endpoint.pump(Instant::now());
            first.update(Instant::now());
            second.update(Instant::now());

            if first.session_keys().is_some() && second.session_keys().is_some() {
                break;
            }
        }

        let first_keys = first.session_keys().expect("first handshake");
        let second_keys = second.session_keys().expect("second handshake");

        assert_ne!(first_keys.receive_key, second_keys.receive_key);
        assert_ne!(first_keys.transmit_key, second_keys.transmit_key);
    }

    #[test]
    fn test_second_login_evicts_first_session() {
        let mut harness = Harness::new();
        harness.login();

        let address = harness.endpoint.local_addr().unwrap();
        let mut second = Client::new(test_policy(), logging::null());
        second.connect(address);

        for _ in 0..500 {
            harness.endpoint.pump(Instant::now());
            second.update(Instant::now());
            if second.session_keys().is_some() {
                break;
            }
        }

        assert!(second.try_login(ALICE, "Alice", ALICE_HASH));

        for _ in 0..500 {
            harness.endpoint.pump(Instant::now());
            second.update(Instant::now());
            if second.state() == SessionState::LoggedIn {
                break;
            }
        }

        assert_eq!(second.state(), SessionState::LoggedIn);

        // The first session gets kicked off the account
        harness.pump_until_event(|event| {
            matches!(event, ClientEvent::Kicked | ClientEvent::ConnectionFailure(_))
        });
    }

    #[test]
    fn test_bad_credentials_rejected() {
        let mut harness = Harness::new();
        harness.login();

        assert!(harness.client.try_logout_from_server());
        harness.pump_until_event(|event| *event == ClientEvent::LogoutSuccess);
        assert_eq!(harness.client.state(), SessionState::Connected);

        assert!(harness.client.try_login(ALICE, "Alice", ALICE_HASH + 1));
        harness.pump_until_event(|event| *event == ClientEvent::LoginFailure("password mismatch".into()));

        assert!(harness.client.try_login(ALICE, "Bob", ALICE_HASH));
        harness.pump_until_event(|event| *event == ClientEvent::LoginFailure("unknown name".into()));

        assert!(harness.client.try_login(ALICE + 1, "Alice", ALICE_HASH));
        harness.pump_until_event(|event| *event == ClientEvent::LoginFailure("unknown identity".into()));
    }

    #[test]
    fn test_garbage_frames_get_kicked() {
        let mut endpoint = test_endpoint(test_policy());
        let address = endpoint.local_addr().unwrap();

        let mut stream = std::net::TcpStream::connect(address).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();

        // Well framed garbage: bad preamble, each one a decode failure
        let mut frame = vec![0u8, 0, 0, 8];
        frame.extend_from_slice(b"zzzzzzzz");

        for _ in 0..6 {
            stream.write_all(&frame).unwrap();
            endpoint.pump(Instant::now());
        }

        for _ in 0..100 {
            endpoint.pump(Instant::now());

            let mut sink = Vec::new();
            match stream.read_to_end(&mut sink) {
                Ok(_) => return,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => (),
                Err(ref err) if err.kind() == io::ErrorKind::TimedOut => (),
                Err(_) => return,
            }
        }

        panic!("Connection was never dropped");
    }

    #[test]
    fn test_idle_connection_purged() {
        let policy = Policy {
            poll_timeout: Duration::from_millis(2),
            idle_timeout: Duration::from_millis(50),
            ..Policy::default()
        };

        let mut endpoint = test_endpoint(policy);
        let address = endpoint.local_addr().unwrap();

        let mut stream = std::net::TcpStream::connect(address).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();

        let start = Instant::now();

        loop {
            endpoint.pump(Instant::now());

            if start.elapsed() > Duration::from_secs(5) {
                panic!("Idle connection was never dropped");
            }

            // The server kicks and closes; read observes Kick bytes then EOF
            let mut sink = Vec::new();
            match stream.read_to_end(&mut sink) {
                Ok(_) => {
                    // The kick notice is a 4 byte frame header plus a 6 byte packet
                    if sink.len() == 10 {
                        assert_eq!(ServerPacket::decode(&sink[4..], None).unwrap(), ServerPacket::Kick);
                    }
                    return;
                }
                Err(_) => (),
            }
        }
    }

    #[test]
    fn test_admin_commands() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut endpoint = test_endpoint(test_policy());
        endpoint.set_control(rx);

        tx.send("verbose true".to_string()).unwrap();
        tx.send("db exec users".to_string()).unwrap();
        tx.send("nonsense".to_string()).unwrap();

        endpoint.pump(Instant::now());

        assert!(endpoint.verbose);

        endpoint.execute_command("verbose false");
        assert!(!endpoint.verbose);
    }
}
