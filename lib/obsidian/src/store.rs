use hashbrown::HashMap;
use quartz::time;
use quartz::UserId;
use std::cmp::Ordering;

/// A registered account. The identity is the external (platform) id, unique per
/// user; names are unique as well.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub identity: UserId,
    pub name: String,
    pub password_hash: u64,
}

/// One active login token per user; minting a new one replaces any prior token.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LoginToken {
    pub identity: UserId,
    pub token: u64,
    pub issued_at: u64,
}

/// A persisted score row, keyed by `(level_validator, identity)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    pub level_validator: String,
    pub timestamp: u64,
    pub identity: UserId,
    pub value: f64,
}

/// Read-only ranked projection of a score for leaderboard display. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedScore {
    pub position: u32,
    pub user_name: String,
    pub timestamp: u64,
    pub value: f64,
}

/// The persistent store collaborator: users, login tokens, scores. Writes are
/// serialized by the single server loop thread; implementations do not need their
/// own locking.
pub trait Store {
    fn add_user(&mut self, user: User);
    fn identity_registered(&self, identity: UserId) -> bool;
    fn name_taken(&self, name: &str) -> bool;
    fn user_by_identity(&self, identity: UserId) -> Option<User>;
    fn remove_user(&mut self, identity: UserId);

    /// Persist a freshly minted token, dropping any prior token for the same user
    /// (single session per account).
    fn replace_token(&mut self, token: LoginToken);
    fn revoke_tokens(&mut self, identity: UserId);
    /// Drop all tokens older than `max_age_secs`, returning the affected identities
    /// so their live connections can be cut as well.
    fn purge_stale_tokens(&mut self, max_age_secs: u64) -> Vec<UserId>;

    /// Persist a validated score. On resubmission for the same key the better value
    /// wins; a worse run never clobbers a better one.
    fn record_score(&mut self, score: Score);
    fn top_scores(&self, level_validator: &str, limit: usize) -> Vec<ProcessedScore>;
    fn own_score(&self, level_validator: &str, identity: UserId) -> Option<ProcessedScore>;

    /// Operator escape hatch for the admin channel. Not part of the client protocol.
    fn exec_raw(&mut self, query: &str) -> String;
}

/// Hash map backed store. The reference implementation for tests and for
/// deployments without an external database.
pub struct MemoryStore {
    users: HashMap<UserId, User>,
    tokens: HashMap<UserId, LoginToken>,
    scores: HashMap<String, HashMap<UserId, Score>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore {
            users: HashMap::new(),
            tokens: HashMap::new(),
            scores: HashMap::new(),
        }
    }

    /// Scores for one level, best first. Ties rank the earlier submission higher.
    fn ranked(&self, level_validator: &str) -> Vec<&Score> {
        let mut rows: Vec<&Score> = match self.scores.get(level_validator) {
            Some(rows) => rows.values().collect(),
            None => return Vec::new(),
        };

        rows.sort_by(|a, b| {
            b.value
                .partial_cmp(&a.value)
                .unwrap_or(Ordering::Equal)
                .then(a.timestamp.cmp(&b.timestamp))
        });

        rows
    }

    fn project(&self, position: u32, score: &Score) -> ProcessedScore {
        let user_name = self
            .users
            .get(&score.identity)
            .map(|user| user.name.clone())
            .unwrap_or_else(|| "<deleted>".to_string());

        ProcessedScore {
            position,
            user_name,
            timestamp: score.timestamp,
            value: score.value,
        }
    }
}

impl Store for MemoryStore {
    fn add_user(&mut self, user: User) {
        self.users.insert(user.identity, user);
    }

    fn identity_registered(&self, identity: UserId) -> bool {
        self.users.contains_key(&identity)
    }

    fn name_taken(&self, name: &str) -> bool {
        self.users.values().any(|user| user.name == name)
    }

    fn user_by_identity(&self, identity: UserId) -> Option<User> {
        self.users.get(&identity).cloned()
    }

    fn remove_user(&mut self, identity: UserId) {
        self.users.remove(&identity);
    }

    fn replace_token(&mut self, token: LoginToken) {
        self.tokens.insert(token.identity, token);
    }

    fn revoke_tokens(&mut self, identity: UserId) {
        self.tokens.remove(&identity);
    }

    fn purge_stale_tokens(&mut self, max_age_secs: u64) -> Vec<UserId> {
        let stale: Vec<UserId> = self
            .tokens
            .values()
            .filter(|token| time::age_secs(token.issued_at) > max_age_secs)
            .map(|token| token.identity)
            .collect();

        for identity in &stale {
            self.tokens.remove(identity);
        }

        stale
    }

    fn record_score(&mut self, score: Score) {
        let rows = self.scores.entry(score.level_validator.clone()).or_default();

        match rows.get(&score.identity) {
            Some(existing) if existing.value >= score.value => (),
            _ => {
                rows.insert(score.identity, score);
            }
        }
    }

    fn top_scores(&self, level_validator: &str, limit: usize) -> Vec<ProcessedScore> {
        self.ranked(level_validator)
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(index, score)| self.project(index as u32 + 1, score))
            .collect()
    }

    fn own_score(&self, level_validator: &str, identity: UserId) -> Option<ProcessedScore> {
        let ranked = self.ranked(level_validator);

        ranked
            .iter()
            .position(|score| score.identity == identity)
            .map(|index| self.project(index as u32 + 1, ranked[index]))
    }

    fn exec_raw(&mut self, query: &str) -> String {
        let mut parts = query.split_whitespace();

        match parts.next() {
            Some("users") => {
                let mut names: Vec<&str> = self.users.values().map(|user| user.name.as_str()).collect();
                names.sort_unstable();
                format!("{} users: {}", names.len(), names.join(", "))
            }
            Some("tokens") => format!("{} active tokens", self.tokens.len()),
            Some("scores") => match parts.next() {
                Some(validator) => {
                    let rows = self.top_scores(validator, usize::max_value());
                    let lines: Vec<String> = rows
                        .iter()
                        .map(|row| format!("#{} {} {:.3}", row.position, row.user_name, row.value))
                        .collect();
                    format!("{} rows\n{}", rows.len(), lines.join("\n"))
                }
                None => "usage: scores <validator>".to_string(),
            },
            _ => format!("unknown query: {}", query),
        }
    }
}
