use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use lz4_flex::block::{compress_prepend_size, decompress_size_prepended};
use std::io::{Cursor, Read};

/// On-disk/on-wire replay format revision.
pub const REPLAY_FORMAT_VERSION: u32 = 2;

/// Longest input sequence a replay may carry (about five hours at 60 fps).
const MAX_FRAME_COUNT: u32 = 1 << 20;

const MAX_FIELD_SIZE: usize = 1024;

/// Upper bound on a decompressed replay (a maximal input sequence plus metadata).
const MAX_DECOMPRESSED_SIZE: usize = 8 << 20;

const LEFT_BIT: u8 = 1;
const RIGHT_BIT: u8 = 1 << 1;
const SWAP_BIT: u8 = 1 << 2;
const FOCUS_BIT: u8 = 1 << 3;

const INPUT_MASK: u8 = LEFT_BIT | RIGHT_BIT | SWAP_BIT | FOCUS_BIT;

#[derive(Debug, Eq, PartialEq)]
pub enum ReplayError {
    Malformed(String),
    UnsupportedVersion(u32),
}

impl From<std::io::Error> for ReplayError {
    #[inline]
    fn from(err: std::io::Error) -> Self {
        ReplayError::Malformed(format!("truncated replay: {}", err))
    }
}

/// The four input bits sampled on one simulated frame.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct FrameInput {
    pub left: bool,
    pub right: bool,
    pub swap: bool,
    pub focus: bool,
}

impl FrameInput {
    #[inline]
    pub fn to_byte(self) -> u8 {
        let mut bits = 0;

        if self.left {
            bits |= LEFT_BIT;
        }
        if self.right {
            bits |= RIGHT_BIT;
        }
        if self.swap {
            bits |= SWAP_BIT;
        }
        if self.focus {
            bits |= FOCUS_BIT;
        }

        bits
    }

    #[inline]
    pub fn from_byte(bits: u8) -> Result<FrameInput, ReplayError> {
        if bits & !INPUT_MASK != 0 {
            return Err(ReplayError::Malformed(format!("invalid input bits {:#04x}", bits)));
        }

        Ok(FrameInput {
            left: bits & LEFT_BIT != 0,
            right: bits & RIGHT_BIT != 0,
            swap: bits & SWAP_BIT != 0,
            focus: bits & FOCUS_BIT != 0,
        })
    }
}

/// Ordered per-frame input records. Append-only while recording, randomly indexable
/// during playback.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ReplayData {
    frames: Vec<FrameInput>,
}

impl ReplayData {
    #[inline]
    pub fn new() -> ReplayData {
        ReplayData { frames: Vec::new() }
    }

    /// Append the inputs for the next frame.
    #[inline]
    pub fn record(&mut self, input: FrameInput) {
        self.frames.push(input);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Inputs for the given frame index.
    #[inline]
    pub fn frame(&self, index: usize) -> Option<FrameInput> {
        self.frames.get(index).copied()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = FrameInput> + '_ {
        self.frames.iter().copied()
    }
}

/// A complete recorded run: enough metadata and input data to deterministically
/// reproduce the play-through and check the claimed score.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayFile {
    pub format_version: u32,
    pub player_name: String,
    pub seed: u64,
    pub data: ReplayData,
    pub pack_id: String,
    pub level_id: String,
    pub music_start_offset: f64,
    pub first_play: bool,
    pub difficulty_mult: f64,
    pub claimed_score: f64,
}

impl ReplayFile {
    /// Serializes into the binary layout. Re-serializing a deserialized file
    /// reproduces identical bytes; no field is lossy.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.data.len());

        out.write_u32::<BigEndian>(self.format_version).expect("Vec write cannot fail");
        write_string(&mut out, &self.player_name);
        out.write_u64::<BigEndian>(self.seed).expect("Vec write cannot fail");

        out.write_u32::<BigEndian>(self.data.len() as u32)
            .expect("Vec write cannot fail");
        for input in self.data.iter() {
            out.push(input.to_byte());
        }

        write_string(&mut out, &self.pack_id);
        write_string(&mut out, &self.level_id);
        out.write_f64::<BigEndian>(self.music_start_offset)
            .expect("Vec write cannot fail");
        out.push(self.first_play as u8);
        out.write_f64::<BigEndian>(self.difficulty_mult)
            .expect("Vec write cannot fail");
        out.write_f64::<BigEndian>(self.claimed_score)
            .expect("Vec write cannot fail");

        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<ReplayFile, ReplayError> {
        let mut cursor = Cursor::new(bytes);

        let format_version = cursor.read_u32::<BigEndian>()?;

        if format_version != REPLAY_FORMAT_VERSION {
            return Err(ReplayError::UnsupportedVersion(format_version));
        }

        let player_name = read_string(&mut cursor)?;
        let seed = cursor.read_u64::<BigEndian>()?;

        let frame_count = cursor.read_u32::<BigEndian>()?;

        if frame_count > MAX_FRAME_COUNT {
            return Err(ReplayError::Malformed(format!("replay of {} frames", frame_count)));
        }

        let mut data = ReplayData::new();

        for _ in 0..frame_count {
            data.record(FrameInput::from_byte(cursor.read_u8()?)?);
        }

        let pack_id = read_string(&mut cursor)?;
        let level_id = read_string(&mut cursor)?;
        let music_start_offset = cursor.read_f64::<BigEndian>()?;
        let first_play = match cursor.read_u8()? {
            0 => false,
            1 => true,
            flag => return Err(ReplayError::Malformed(format!("invalid first play flag {}", flag))),
        };
        let difficulty_mult = cursor.read_f64::<BigEndian>()?;
        let claimed_score = cursor.read_f64::<BigEndian>()?;

        Ok(ReplayFile {
            format_version,
            player_name,
            seed,
            data,
            pack_id,
            level_id,
            music_start_offset,
            first_play,
            difficulty_mult,
            claimed_score,
        })
    }

    /// The leaderboard key this run competes under.
    #[inline]
    pub fn level_validator(&self) -> String {
        level_validator(&self.level_id, self.difficulty_mult)
    }
}

/// Opaque compressed form of a `ReplayFile`, used on the wire and on disk.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CompressedReplay {
    pub data: Vec<u8>,
}

impl CompressedReplay {
    pub fn compress(file: &ReplayFile) -> CompressedReplay {
        CompressedReplay {
            data: compress_prepend_size(&file.serialize()),
        }
    }

    pub fn decompress(&self) -> Result<ReplayFile, ReplayError> {
        if self.data.len() < 4 {
            return Err(ReplayError::Malformed("compressed replay too short".into()));
        }

        // The prepended size is attacker controlled; bound it before allocating
        let claimed = u32::from_le_bytes([self.data[0], self.data[1], self.data[2], self.data[3]]) as usize;

        if claimed > MAX_DECOMPRESSED_SIZE {
            return Err(ReplayError::Malformed(format!("decompressed replay of {} bytes", claimed)));
        }

        let raw = decompress_size_prepended(&self.data)
            .map_err(|err| ReplayError::Malformed(format!("corrupt compressed replay: {}", err)))?;

        ReplayFile::deserialize(&raw)
    }
}

/// Derives the string key namespacing leaderboard and validator data for one level
/// configuration, e.g. `"L1_m_1.0"`.
#[inline]
pub fn level_validator(level_id: &str, difficulty_mult: f64) -> String {
    format!("{}_m_{:?}", level_id, difficulty_mult)
}

fn write_string(out: &mut Vec<u8>, value: &str) {
    out.write_u32::<BigEndian>(value.len() as u32)
        .expect("Vec write cannot fail");
    out.extend_from_slice(value.as_bytes());
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String, ReplayError> {
    let size = cursor.read_u32::<BigEndian>()? as usize;

    if size > MAX_FIELD_SIZE {
        return Err(ReplayError::Malformed(format!("string field of {} bytes", size)));
    }

    let mut raw = vec![0u8; size];
    cursor.read_exact(&mut raw)?;

    String::from_utf8(raw).map_err(|_| ReplayError::Malformed("string field is not valid utf-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn random_data(frames: usize) -> ReplayData {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut data = ReplayData::new();

        for _ in 0..frames {
            data.record(FrameInput {
                left: rng.gen(),
                right: rng.gen(),
                swap: rng.gen(),
                focus: rng.gen(),
            });
        }

        data
    }

    fn sample_file(frames: usize) -> ReplayFile {
        ReplayFile {
            format_version: REPLAY_FORMAT_VERSION,
            player_name: "Alice".into(),
            seed: 0x0123_4567_89ab_cdef,
            data: random_data(frames),
            pack_id: "base".into(),
            level_id: "L1".into(),
            music_start_offset: 12.25,
            first_play: true,
            difficulty_mult: 1.0,
            claimed_score: 63.8125,
        }
    }

    #[test]
    fn test_frame_input_bits_roundtrip() {
        for bits in 0..=INPUT_MASK {
            let input = FrameInput::from_byte(bits).unwrap();
            assert_eq!(input.to_byte(), bits);
        }
    }

    #[test]
    fn test_frame_input_rejects_spurious_bits() {
        for bits in (INPUT_MASK + 1)..=255 {
            if bits & !INPUT_MASK != 0 {
                assert!(FrameInput::from_byte(bits).is_err());
            }
        }
    }

    #[test]
    fn test_replay_data_playback_order() {
        let data = random_data(100);

        let replayed: Vec<_> = (0..data.len()).map(|i| data.frame(i).unwrap()).collect();
        let recorded: Vec<_> = data.iter().collect();

        assert_eq!(replayed, recorded);
        assert_eq!(data.frame(100), None);
    }

    #[test]
    fn test_file_roundtrip_identity() {
        for frames in &[0usize, 1, 5000] {
            let file = sample_file(*frames);
            let bytes = file.serialize();
            let decoded = ReplayFile::deserialize(&bytes).unwrap();

            assert_eq!(decoded, file);
            // Byte identity, not just structural equality
            assert_eq!(decoded.serialize(), bytes);
        }
    }

    #[test]
    fn test_deserialize_rejects_unsupported_version() {
        let mut file = sample_file(10);
        file.format_version = REPLAY_FORMAT_VERSION + 1;

        assert_eq!(
            ReplayFile::deserialize(&file.serialize()),
            Err(ReplayError::UnsupportedVersion(REPLAY_FORMAT_VERSION + 1))
        );
    }

    #[test]
    fn test_deserialize_rejects_truncation() {
        let bytes = sample_file(20).serialize();

        for size in 0..bytes.len() {
            assert!(ReplayFile::deserialize(&bytes[..size]).is_err(), "size {}", size);
        }
    }

    #[test]
    fn test_compressed_roundtrip_identity() {
        let file = sample_file(3000);

        let compressed = CompressedReplay::compress(&file);
        let restored = compressed.decompress().unwrap();

        assert_eq!(restored, file);
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        let garbage = CompressedReplay {
            data: vec![0xff; 64],
        };

        assert!(garbage.decompress().is_err());
    }

    #[test]
    fn test_level_validator_shape() {
        assert_eq!(level_validator("L1", 1.0), "L1_m_1.0");
        assert_eq!(level_validator("hyper", 2.5), "hyper_m_2.5");
    }
}
