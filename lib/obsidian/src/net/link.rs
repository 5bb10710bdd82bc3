use crate::net::buffer::Buffer;
use crate::net::support::{FaultKind, NetError, NetResult};
use byteorder::{BigEndian, ByteOrder};
use std::io;
use std::net::Shutdown;

const FRAME_HEADER_SIZE: usize = 4;

/// Stream types a `Link` can drive. One framing implementation serves both the client
/// (std non-blocking stream) and the server (mio stream) through composition.
pub trait NetStream: io::Read + io::Write {
    fn shutdown(&mut self);
}

impl NetStream for std::net::TcpStream {
    fn shutdown(&mut self) {
        let _ = std::net::TcpStream::shutdown(self, Shutdown::Both);
    }
}

impl NetStream for mio::net::TcpStream {
    fn shutdown(&mut self) {
        let _ = mio::net::TcpStream::shutdown(self, Shutdown::Both);
    }
}

/// A framed, buffered, non-blocking transport over a single stream. Frames are a
/// 4 byte big-endian length followed by the body; framing carries no protocol
/// knowledge, packets are opaque bytes at this layer.
pub struct Link<S: NetStream> {
    stream: S,
    read_buffer: Buffer,
    write_buffer: Buffer,
    max_frame_size: usize,
    max_send_stalls: u32,
    send_stalls: u32,
}

impl<S: NetStream> Link<S> {
    pub fn new(stream: S, max_frame_size: usize, max_send_stalls: u32) -> Link<S> {
        Link {
            stream,
            read_buffer: Buffer::new(max_frame_size + FRAME_HEADER_SIZE),
            write_buffer: Buffer::new((max_frame_size + FRAME_HEADER_SIZE) * 2),
            max_frame_size,
            max_send_stalls,
            send_stalls: 0,
        }
    }

    #[inline]
    pub fn stream(&self) -> &S {
        &self.stream
    }

    #[inline]
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Returns true if there is outgoing data queued on the link.
    #[inline]
    pub fn has_egress(&self) -> bool {
        !self.write_buffer.is_empty()
    }

    /// Queue one frame and push as much pending data to the stream as possible.
    /// `Ok` means the frame is queued (possibly not fully on the wire yet); `Wait`
    /// means it did not fit in the write buffer and must be retried once the
    /// backlog drains.
    pub fn send(&mut self, frame: &[u8]) -> NetResult<()> {
        if frame.is_empty() {
            return Err(NetError::Fatal(FaultKind::EmptyFrame));
        }

        if frame.len() > self.max_frame_size {
            return Err(NetError::Fatal(FaultKind::FrameTooLarge));
        }

        if self.write_buffer.free_capacity() < FRAME_HEADER_SIZE + frame.len() {
            return Err(NetError::Wait);
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        BigEndian::write_u32(&mut header, frame.len() as u32);

        self.write_buffer.queue(&header);
        self.write_buffer.queue(frame);

        match self.flush() {
            Ok(()) | Err(NetError::Wait) => Ok(()),
            err => err,
        }
    }

    /// Push pending data to the stream. A pass that moves no bytes while data is
    /// pending counts as a stall; too many consecutive stalls fail the link hard,
    /// bounding the worst case hold-up a dead peer can cause.
    pub fn flush(&mut self) -> NetResult<()> {
        if self.write_buffer.is_empty() {
            self.send_stalls = 0;
            return Ok(());
        }

        let written = self.write_buffer.egress(&mut self.stream)?;

        if written == 0 {
            self.send_stalls += 1;

            if self.send_stalls >= self.max_send_stalls {
                return Err(NetError::Fatal(FaultKind::Stalled));
            }

            return Err(NetError::Wait);
        }

        self.send_stalls = 0;

        if self.write_buffer.is_empty() {
            Ok(())
        } else {
            Err(NetError::Wait)
        }
    }

    /// Pull available data off the stream and return the next complete frame.
    /// `Wait` means no full frame has arrived yet. Should be called until it
    /// returns `Wait` so no buffered frame is left behind.
    pub fn receive(&mut self) -> NetResult<Vec<u8>> {
        let closed = match self.read_buffer.ingress(&mut self.stream) {
            Ok(_) => false,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => false,
            Err(ref err) if err.kind() == io::ErrorKind::UnexpectedEof => true,
            Err(err) => return Err(err.into()),
        };

        match self.parse_frame()? {
            Some(frame) => Ok(frame),
            None if closed => Err(NetError::Fatal(FaultKind::Closed)),
            None => Err(NetError::Wait),
        }
    }

    /// Shut the stream down and drop all buffered data.
    pub fn disconnect(&mut self) {
        self.read_buffer.clear();
        self.write_buffer.clear();
        self.stream.shutdown();
    }

    fn parse_frame(&mut self) -> NetResult<Option<Vec<u8>>> {
        let pending = self.read_buffer.read_slice();

        if pending.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let frame_size = BigEndian::read_u32(&pending[..FRAME_HEADER_SIZE]) as usize;

        if frame_size == 0 {
            return Err(NetError::Fatal(FaultKind::EmptyFrame));
        }

        if frame_size > self.max_frame_size {
            return Err(NetError::Fatal(FaultKind::FrameTooLarge));
        }

        if pending.len() < FRAME_HEADER_SIZE + frame_size {
            return Ok(None);
        }

        let frame = pending[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + frame_size].to_vec();
        self.read_buffer.consume(FRAME_HEADER_SIZE + frame_size);

        Ok(Some(frame))
    }
}
