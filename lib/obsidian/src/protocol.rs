use crate::replay::CompressedReplay;
use crate::store::ProcessedScore;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use quartz::crypto::{self, Nonce, PublicKey, SessionKey};
use quartz::UserId;
use std::io::{Cursor, Read};

/// Every packet leads with these two bytes.
pub const PREAMBLE: [u8; 2] = *b"oh";

/// Longest string any packet field may carry.
pub const MAX_STRING_SIZE: usize = 1024;

/// Longest score list any packet may carry.
const MAX_SCORE_COUNT: u32 = 4096;

/// Protocol version, one byte per component. Checked for exact equality on receipt;
/// there is no cross version negotiation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub micro: u8,
}

impl Version {
    pub const CURRENT: Version = Version {
        major: 0,
        minor: 3,
        micro: 1,
    };
}

/// The encrypted wrapper carrying an inner packet as AEAD ciphertext.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub nonce: Nonce,
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, PartialEq)]
pub enum PacketError {
    /// Malformed or mismatched bytes. Carries a diagnostic; the caller decides
    /// whether the connection survives.
    Invalid(String),
    /// Failed envelope decryption. Always fatal for the connection.
    Crypto,
}

impl From<std::io::Error> for PacketError {
    #[inline]
    fn from(err: std::io::Error) -> Self {
        PacketError::Invalid(format!("truncated packet: {}", err))
    }
}

/// Client to server packets. The wire tag is the variant position in this
/// enumeration; the order is part of the wire contract and may only be appended to.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientPacket {
    Heartbeat,
    Disconnect,
    PublicKey(PublicKey),
    Register {
        identity: UserId,
        name: String,
        password_hash: u64,
    },
    Login {
        identity: UserId,
        name: String,
        password_hash: u64,
    },
    Logout {
        identity: UserId,
    },
    DeleteAccount {
        identity: UserId,
        password_hash: u64,
    },
    RequestTopScores {
        token: u64,
        level_validator: String,
    },
    RequestOwnScore {
        token: u64,
        level_validator: String,
    },
    RequestTopScoresAndOwnScore {
        token: u64,
        level_validator: String,
    },
    StartedGame {
        token: u64,
        level_validator: String,
    },
    Replay {
        token: u64,
        replay: CompressedReplay,
    },
    Encrypted(Envelope),
}

/// Server to client packets. Same tag contract as `ClientPacket`.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerPacket {
    Kick,
    PublicKey(PublicKey),
    RegistrationSuccess,
    RegistrationFailure {
        error: String,
    },
    LoginSuccess {
        token: u64,
        name: String,
    },
    LoginFailure {
        error: String,
    },
    LogoutSuccess,
    LogoutFailure,
    DeleteAccountSuccess,
    DeleteAccountFailure {
        error: String,
    },
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
    Encrypted(Envelope),
}

impl ClientPacket {
    #[inline]
    fn tag(&self) -> u8 {
        match self {
            ClientPacket::Heartbeat => 0,
            ClientPacket::Disconnect => 1,
            ClientPacket::PublicKey(_) => 2,
            ClientPacket::Register { .. } => 3,
            ClientPacket::Login { .. } => 4,
            ClientPacket::Logout { .. } => 5,
            ClientPacket::DeleteAccount { .. } => 6,
            ClientPacket::RequestTopScores { .. } => 7,
            ClientPacket::RequestOwnScore { .. } => 8,
            ClientPacket::RequestTopScoresAndOwnScore { .. } => 9,
            ClientPacket::StartedGame { .. } => 10,
            ClientPacket::Replay { .. } => 11,
            ClientPacket::Encrypted(_) => 12,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        write_header(&mut out, self.tag());

        match self {
            ClientPacket::Heartbeat | ClientPacket::Disconnect => (),
            ClientPacket::PublicKey(key) => out.extend_from_slice(&key[..]),
            ClientPacket::Register {
                identity,
                name,
                password_hash,
            }
            | ClientPacket::Login {
                identity,
                name,
                password_hash,
            } => {
                write_u64(&mut out, *identity);
                write_string(&mut out, name);
                write_u64(&mut out, *password_hash);
            }
            ClientPacket::Logout { identity } => write_u64(&mut out, *identity),
            ClientPacket::DeleteAccount {
                identity,
                password_hash,
            } => {
                write_u64(&mut out, *identity);
                write_u64(&mut out, *password_hash);
            }
            ClientPacket::RequestTopScores {
                token,
                level_validator,
            }
            | ClientPacket::RequestOwnScore {
                token,
                level_validator,
            }
            | ClientPacket::RequestTopScoresAndOwnScore {
                token,
                level_validator,
            }
            | ClientPacket::StartedGame {
                token,
                level_validator,
            } => {
                write_u64(&mut out, *token);
                write_string(&mut out, level_validator);
            }
            ClientPacket::Replay { token, replay } => {
                write_u64(&mut out, *token);
                write_u64(&mut out, replay.data.len() as u64);
                out.extend_from_slice(&replay.data);
            }
            ClientPacket::Encrypted(envelope) => write_envelope(&mut out, envelope),
        }

        out
    }

    /// Decodes a packet, recursing through the encrypted envelope when a receive key
    /// is available. Never panics on malformed input; the caller decides what an
    /// `Invalid` result means for the connection.
    pub fn decode(bytes: &[u8], receive_key: Option<&SessionKey>) -> Result<ClientPacket, PacketError> {
        let (tag, mut cursor) = read_header(bytes)?;

        let packet = match tag {
            0 => ClientPacket::Heartbeat,
            1 => ClientPacket::Disconnect,
            2 => ClientPacket::PublicKey(read_public_key(&mut cursor)?),
            3 => ClientPacket::Register {
                identity: cursor.read_u64::<BigEndian>()?,
                name: read_string(&mut cursor)?,
                password_hash: cursor.read_u64::<BigEndian>()?,
            },
            4 => ClientPacket::Login {
                identity: cursor.read_u64::<BigEndian>()?,
                name: read_string(&mut cursor)?,
                password_hash: cursor.read_u64::<BigEndian>()?,
            },
            5 => ClientPacket::Logout {
                identity: cursor.read_u64::<BigEndian>()?,
            },
            6 => ClientPacket::DeleteAccount {
                identity: cursor.read_u64::<BigEndian>()?,
                password_hash: cursor.read_u64::<BigEndian>()?,
            },
            7 => ClientPacket::RequestTopScores {
                token: cursor.read_u64::<BigEndian>()?,
                level_validator: read_string(&mut cursor)?,
            },
            8 => ClientPacket::RequestOwnScore {
                token: cursor.read_u64::<BigEndian>()?,
                level_validator: read_string(&mut cursor)?,
            },
            9 => ClientPacket::RequestTopScoresAndOwnScore {
                token: cursor.read_u64::<BigEndian>()?,
                level_validator: read_string(&mut cursor)?,
            },
            10 => ClientPacket::StartedGame {
                token: cursor.read_u64::<BigEndian>()?,
                level_validator: read_string(&mut cursor)?,
            },
            11 => ClientPacket::Replay {
                token: cursor.read_u64::<BigEndian>()?,
                replay: read_compressed_replay(&mut cursor)?,
            },
            12 => {
                let envelope = read_envelope(&mut cursor)?;
                let plain = open_envelope(&envelope, receive_key)?;
                return ClientPacket::decode(&plain, receive_key);
            }
            tag => return Err(PacketError::Invalid(format!("unknown client packet tag {}", tag))),
        };

        Ok(packet)
    }

    /// Encodes the packet inside an encrypted envelope with a fresh random nonce.
    /// Returns `None` on an encryption failure.
    pub fn seal(&self, transmit_key: &SessionKey) -> Option<Vec<u8>> {
        let envelope = seal_bytes(&self.encode(), transmit_key)?;
        Some(ClientPacket::Encrypted(envelope).encode())
    }
}

impl ServerPacket {
    #[inline]
    fn tag(&self) -> u8 {
        match self {
            ServerPacket::Kick => 0,
            ServerPacket::PublicKey(_) => 1,
            ServerPacket::RegistrationSuccess => 2,
            ServerPacket::RegistrationFailure { .. } => 3,
            ServerPacket::LoginSuccess { .. } => 4,
            ServerPacket::LoginFailure { .. } => 5,
            ServerPacket::LogoutSuccess => 6,
            ServerPacket::LogoutFailure => 7,
            ServerPacket::DeleteAccountSuccess => 8,
            ServerPacket::DeleteAccountFailure { .. } => 9,
            ServerPacket::TopScores { .. } => 10,
            ServerPacket::OwnScore { .. } => 11,
            ServerPacket::TopScoresAndOwnScore { .. } => 12,
            ServerPacket::Encrypted(_) => 13,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        write_header(&mut out, self.tag());

        match self {
            ServerPacket::Kick
            | ServerPacket::RegistrationSuccess
            | ServerPacket::LogoutSuccess
            | ServerPacket::LogoutFailure
            | ServerPacket::DeleteAccountSuccess => (),
            ServerPacket::PublicKey(key) => out.extend_from_slice(&key[..]),
            ServerPacket::RegistrationFailure { error }
            | ServerPacket::LoginFailure { error }
            | ServerPacket::DeleteAccountFailure { error } => write_string(&mut out, error),
            ServerPacket::LoginSuccess { token, name } => {
                write_u64(&mut out, *token);
                write_string(&mut out, name);
            }
            ServerPacket::TopScores {
                level_validator,
                scores,
            } => {
                write_string(&mut out, level_validator);
                write_scores(&mut out, scores);
            }
            ServerPacket::OwnScore {
                level_validator,
                score,
            } => {
                write_string(&mut out, level_validator);
                write_score(&mut out, score);
            }
            ServerPacket::TopScoresAndOwnScore {
                level_validator,
                scores,
                own_score,
            } => {
                write_string(&mut out, level_validator);
                write_scores(&mut out, scores);
                match own_score {
                    Some(score) => {
                        out.push(1);
                        write_score(&mut out, score);
                    }
                    None => out.push(0),
                }
            }
            ServerPacket::Encrypted(envelope) => write_envelope(&mut out, envelope),
        }

        out
    }

    pub fn decode(bytes: &[u8], receive_key: Option<&SessionKey>) -> Result<ServerPacket, PacketError> {
        let (tag, mut cursor) = read_header(bytes)?;

        let packet = match tag {
            0 => ServerPacket::Kick,
            1 => ServerPacket::PublicKey(read_public_key(&mut cursor)?),
            2 => ServerPacket::RegistrationSuccess,
            3 => ServerPacket::RegistrationFailure {
                error: read_string(&mut cursor)?,
            },
            4 => ServerPacket::LoginSuccess {
                token: cursor.read_u64::<BigEndian>()?,
                name: read_string(&mut cursor)?,
            },
            5 => ServerPacket::LoginFailure {
                error: read_string(&mut cursor)?,
            },
            6 => ServerPacket::LogoutSuccess,
            7 => ServerPacket::LogoutFailure,
            8 => ServerPacket::DeleteAccountSuccess,
            9 => ServerPacket::DeleteAccountFailure {
                error: read_string(&mut cursor)?,
            },
            10 => ServerPacket::TopScores {
                level_validator: read_string(&mut cursor)?,
                scores: read_scores(&mut cursor)?,
            },
            11 => ServerPacket::OwnScore {
                level_validator: read_string(&mut cursor)?,
                score: read_score(&mut cursor)?,
            },
            12 => ServerPacket::TopScoresAndOwnScore {
                level_validator: read_string(&mut cursor)?,
                scores: read_scores(&mut cursor)?,
                own_score: match cursor.read_u8()? {
                    0 => None,
                    1 => Some(read_score(&mut cursor)?),
                    flag => {
                        return Err(PacketError::Invalid(format!("invalid own score flag {}", flag)));
                    }
                },
            },
            13 => {
                let envelope = read_envelope(&mut cursor)?;
                let plain = open_envelope(&envelope, receive_key)?;
                return ServerPacket::decode(&plain, receive_key);
            }
            tag => return Err(PacketError::Invalid(format!("unknown server packet tag {}", tag))),
        };

        Ok(packet)
    }

    pub fn seal(&self, transmit_key: &SessionKey) -> Option<Vec<u8>> {
        let envelope = seal_bytes(&self.encode(), transmit_key)?;
        Some(ServerPacket::Encrypted(envelope).encode())
    }
}

/// Preamble and version bytes, bound into every envelope as AEAD additional data so
/// a ciphertext cannot be replayed across protocol versions.
#[inline]
fn additional_data() -> [u8; 5] {
    [
        PREAMBLE[0],
        PREAMBLE[1],
        Version::CURRENT.major,
        Version::CURRENT.minor,
        Version::CURRENT.micro,
    ]
}

fn write_header(out: &mut Vec<u8>, tag: u8) {
    out.extend_from_slice(&PREAMBLE);
    out.push(Version::CURRENT.major);
    out.push(Version::CURRENT.minor);
    out.push(Version::CURRENT.micro);
    out.push(tag);
}

/// Verifies preamble and version, returning the tag and a cursor positioned at the
/// payload. Mismatches short-circuit into `Invalid` with a diagnostic.
fn read_header(bytes: &[u8]) -> Result<(u8, Cursor<&[u8]>), PacketError> {
    if bytes.len() < 6 {
        return Err(PacketError::Invalid(format!("packet too short ({} bytes)", bytes.len())));
    }

    if bytes[..2] != PREAMBLE {
        return Err(PacketError::Invalid(format!(
            "bad preamble {:02x}{:02x}",
            bytes[0], bytes[1]
        )));
    }

    let version = Version {
        major: bytes[2],
        minor: bytes[3],
        micro: bytes[4],
    };

    if version != Version::CURRENT {
        return Err(PacketError::Invalid(format!(
            "version mismatch: got {}.{}.{}, running {}.{}.{}",
            version.major,
            version.minor,
            version.micro,
            Version::CURRENT.major,
            Version::CURRENT.minor,
            Version::CURRENT.micro
        )));
    }

    let mut cursor = Cursor::new(bytes);
    cursor.set_position(6);

    Ok((bytes[5], cursor))
}

#[inline]
fn write_u64(out: &mut Vec<u8>, value: u64) {
    out.write_u64::<BigEndian>(value).expect("Vec write cannot fail");
}

fn write_string(out: &mut Vec<u8>, value: &str) {
    out.write_u32::<BigEndian>(value.len() as u32)
        .expect("Vec write cannot fail");
    out.extend_from_slice(value.as_bytes());
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String, PacketError> {
    let size = cursor.read_u32::<BigEndian>()? as usize;

    if size > MAX_STRING_SIZE {
        return Err(PacketError::Invalid(format!("string field of {} bytes", size)));
    }

    let mut raw = vec![0u8; size];
    cursor.read_exact(&mut raw)?;

    String::from_utf8(raw).map_err(|_| PacketError::Invalid("string field is not valid utf-8".into()))
}

fn read_public_key(cursor: &mut Cursor<&[u8]>) -> Result<PublicKey, PacketError> {
    let mut key = [0u8; crypto::PUBLIC_KEY_SIZE];
    cursor.read_exact(&mut key)?;
    Ok(key)
}

fn write_score(out: &mut Vec<u8>, score: &ProcessedScore) {
    out.write_u32::<BigEndian>(score.position).expect("Vec write cannot fail");
    write_string(out, &score.user_name);
    write_u64(out, score.timestamp);
    out.write_f64::<BigEndian>(score.value).expect("Vec write cannot fail");
}

fn read_score(cursor: &mut Cursor<&[u8]>) -> Result<ProcessedScore, PacketError> {
    Ok(ProcessedScore {
        position: cursor.read_u32::<BigEndian>()?,
        user_name: read_string(cursor)?,
        timestamp: cursor.read_u64::<BigEndian>()?,
        value: cursor.read_f64::<BigEndian>()?,
    })
}

fn write_scores(out: &mut Vec<u8>, scores: &[ProcessedScore]) {
    out.write_u32::<BigEndian>(scores.len() as u32)
        .expect("Vec write cannot fail");

    for score in scores {
        write_score(out, score);
    }
}

fn read_scores(cursor: &mut Cursor<&[u8]>) -> Result<Vec<ProcessedScore>, PacketError> {
    let count = cursor.read_u32::<BigEndian>()?;

    if count > MAX_SCORE_COUNT {
        return Err(PacketError::Invalid(format!("score list of {} entries", count)));
    }

    let mut scores = Vec::with_capacity(count as usize);

    for _ in 0..count {
        scores.push(read_score(cursor)?);
    }

    Ok(scores)
}

fn read_compressed_replay(cursor: &mut Cursor<&[u8]>) -> Result<CompressedReplay, PacketError> {
    let size = cursor.read_u64::<BigEndian>()? as usize;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;

    if size > remaining {
        return Err(PacketError::Invalid(format!(
            "replay blob of {} bytes exceeds the {} remaining",
            size, remaining
        )));
    }

    let mut data = vec![0u8; size];
    cursor.read_exact(&mut data)?;

    Ok(CompressedReplay { data })
}

fn write_envelope(out: &mut Vec<u8>, envelope: &Envelope) {
    out.extend_from_slice(&envelope.nonce);
    write_u64(out, (envelope.ciphertext.len() - crypto::MAC_SIZE) as u64);
    write_u64(out, envelope.ciphertext.len() as u64);
    out.extend_from_slice(&envelope.ciphertext);
}

fn read_envelope(cursor: &mut Cursor<&[u8]>) -> Result<Envelope, PacketError> {
    let mut nonce = [0u8; crypto::NONCE_SIZE];
    cursor.read_exact(&mut nonce)?;

    let plain_size = cursor.read_u64::<BigEndian>()?;
    let cipher_size = cursor.read_u64::<BigEndian>()?;

    if plain_size.checked_add(crypto::MAC_SIZE as u64) != Some(cipher_size) {
        return Err(PacketError::Invalid(format!(
            "envelope length mismatch: {} cipher bytes for {} plain",
            cipher_size, plain_size
        )));
    }

    let remaining = cursor.get_ref().len() - cursor.position() as usize;

    if cipher_size as usize > remaining {
        return Err(PacketError::Invalid(format!(
            "envelope of {} bytes exceeds the {} remaining",
            cipher_size, remaining
        )));
    }

    let mut ciphertext = vec![0u8; cipher_size as usize];
    cursor.read_exact(&mut ciphertext)?;

    Ok(Envelope { nonce, ciphertext })
}

fn seal_bytes(plain: &[u8], transmit_key: &SessionKey) -> Option<Envelope> {
    let nonce = crypto::random_nonce();
    let mut ciphertext = vec![0u8; plain.len() + crypto::MAC_SIZE];

    if !crypto::encrypt(&mut ciphertext, plain, &additional_data(), &nonce, transmit_key) {
        return None;
    }

    Some(Envelope { nonce, ciphertext })
}

fn open_envelope(envelope: &Envelope, receive_key: Option<&SessionKey>) -> Result<Vec<u8>, PacketError> {
    let key = match receive_key {
        Some(key) => key,
        None => {
            return Err(PacketError::Invalid(
                "encrypted envelope received before key exchange".into(),
            ));
        }
    };

    let mut plain = vec![0u8; envelope.ciphertext.len() - crypto::MAC_SIZE];

    if !crypto::decrypt(&mut plain, &envelope.ciphertext, &additional_data(), &envelope.nonce, key) {
        return Err(PacketError::Crypto);
    }

    Ok(plain)
}
