use std::io;

/// A FIFO byte buffer bounded by a fixed capacity limit. Data is queued at the tail
/// and consumed from the head; the backing storage is compacted once the head has
/// advanced past half of it.
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    limit: usize,
}

impl Buffer {
    #[inline]
    pub fn new(limit: usize) -> Buffer {
        Buffer {
            data: Vec::with_capacity(limit.min(65536)),
            head: 0,
            limit,
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.limit - self.len()
    }

    /// Slice containing all buffered data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    /// Discard `count` bytes from the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        assert!(count <= self.len(), "Consumed past the buffered data");

        self.head += count;

        if self.head == self.data.len() {
            self.data.clear();
            self.head = 0;
        } else if self.head > self.data.len() / 2 {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }

    /// Queue the supplied bytes at the tail. Returns false (and queues nothing) when
    /// the bytes do not fit in the remaining capacity.
    #[inline]
    pub fn queue(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.free_capacity() {
            return false;
        }

        self.data.extend_from_slice(bytes);
        true
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    /// Write buffered data to the supplied writer, advancing the head. Stops at the
    /// first `WouldBlock` and returns the number of bytes written so far. A writer
    /// accepting zero bytes is an error.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let mut written = 0;

        while !self.is_empty() {
            match writer.write(self.read_slice()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    self.consume(count);
                    written += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(written)
    }

    /// Read data from the supplied reader into the buffer until the reader has no
    /// more data or the capacity limit is reached. Returns the number of bytes read.
    /// A zero length read (the peer closed the stream) surfaces as `UnexpectedEof`
    /// unless data was buffered first.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let mut total = 0;
        let mut chunk = [0u8; 4096];

        while self.free_capacity() > 0 {
            let want = chunk.len().min(self.free_capacity());

            match reader.read(&mut chunk[..want]) {
                Ok(0) => {
                    if total == 0 {
                        return Err(io::ErrorKind::UnexpectedEof.into());
                    }
                    break;
                }
                Ok(count) => {
                    self.data.extend_from_slice(&chunk[..count]);
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;
    use std::io::Cursor;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        pub fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                max_size,
            }
        }

        pub fn clear(&mut self) {
            self.data.clear();
            self.cursor = 0;
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(self.chunk, buf.len());
            self.data.extend(&buf[..count]);

            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_roundtrip() {
        let mock_data: Vec<_> = (0..40000).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(mock_data.clone(), 500, mock_data.len());

        let mut buffer = Buffer::new(65536);

        let count = buffer.ingress(&mut channel).unwrap();

        assert_eq!(count, mock_data.len());
        assert_eq!(buffer.read_slice(), &mock_data[..]);

        channel.clear();
        let count = buffer.egress(&mut channel).unwrap();

        assert_eq!(count, mock_data.len());
        assert!(buffer.is_empty());
        assert_eq!(channel.data[..], mock_data[..]);
    }

    #[test]
    fn test_egress_stops_at_would_block() {
        let mut channel = MockChannel::new(Vec::new(), 10, 25);
        let mut buffer = Buffer::new(65536);

        buffer.queue(&[7u8; 100]);

        let count = buffer.egress(&mut channel).unwrap();

        assert_eq!(count, 25);
        assert_eq!(buffer.len(), 75);
    }

    #[test]
    fn test_egress_error_on_zero_write() {
        let mut zero_vec = vec![];

        let mut buffer = Buffer::new(65536);
        buffer.queue(&[1]);

        let result = buffer.egress(&mut zero_vec[..]);

        assert!(result.is_err());
        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_ingress_respects_capacity_limit() {
        let mock_data: Vec<_> = (0..200).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(mock_data, 64, 0);

        let mut buffer = Buffer::new(128);

        let count = buffer.ingress(&mut channel).unwrap();

        assert_eq!(count, 128);
        assert_eq!(buffer.free_capacity(), 0);

        // The rest fits after the first half is consumed
        buffer.consume(100);
        let count = buffer.ingress(&mut channel).unwrap();

        assert_eq!(count, 72);
        assert_eq!(buffer.len(), 100);
    }

    #[test]
    fn test_ingress_eof_on_closed_peer() {
        let mut buffer = Buffer::new(65536);

        let result = buffer.ingress(&[][..]);

        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_ingress_keeps_data_read_before_close() {
        let mut buffer = Buffer::new(65536);

        let count = buffer.ingress(&[1u8, 2, 3][..]).unwrap();

        assert_eq!(count, 3);
        assert_eq!(buffer.read_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_queue_rejects_overflow() {
        let mut buffer = Buffer::new(8);

        assert!(buffer.queue(&[0u8; 8]));
        assert!(!buffer.queue(&[0u8; 1]));
        assert_eq!(buffer.len(), 8);
    }

    #[test]
    fn test_consume_compacts_storage() {
        let mut buffer = Buffer::new(65536);
        buffer.queue(&[5u8; 1000]);

        buffer.consume(800);

        assert_eq!(buffer.len(), 200);
        assert_eq!(buffer.read_slice(), &[5u8; 200][..]);

        let mut cursor = Cursor::new(Vec::<u8>::new());
        buffer.egress(&mut cursor).unwrap();

        assert_eq!(cursor.get_ref().len(), 200);
    }

    #[test]
    #[should_panic(expected = "Consumed past the buffered data")]
    fn test_consume_past_data_panics() {
        let mut buffer = Buffer::new(65536);
        buffer.queue(&[1, 2, 3]);
        buffer.consume(4);
    }
}
