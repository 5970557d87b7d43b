use std::io;
use std::os::fd::RawFd;

/// Growable byte buffer with a cheap prependable prefix.
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// |                   |     (CONTENT)    |                  |
/// +-------------------+------------------+------------------+
/// |                   |                  |                  |
/// 0      <=      reader index  <=  writer index   <=    size
/// ```
///
/// The prefix starts at [`CHEAP_PREPEND`](Buffer::CHEAP_PREPEND) bytes so a
/// length-prefix header can be prepended without relocating the payload.
/// A write that does not fit first reclaims the prependable region by
/// shifting the readable span left; only if that is still not enough does
/// the buffer grow.
#[derive(Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Buffer {
    /// Reserved prefix for prepended headers.
    pub const CHEAP_PREPEND: usize = 8;
    /// Initial writable capacity.
    pub const INITIAL_SIZE: usize = 1024;

    pub fn new() -> Buffer {
        Buffer::with_capacity(Buffer::INITIAL_SIZE)
    }

    pub fn with_capacity(initial_size: usize) -> Buffer {
        Buffer {
            buf: vec![0; Buffer::CHEAP_PREPEND + initial_size],
            reader_index: Buffer::CHEAP_PREPEND,
            writer_index: Buffer::CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// The readable span.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Position of the first `\r\n` in the readable span.
    pub fn find_crlf(&self) -> Option<usize> {
        self.peek().windows(2).position(|w| w == b"\r\n")
    }

    /// Position of the first `\n` in the readable span.
    pub fn find_eol(&self) -> Option<usize> {
        self.peek().iter().position(|&b| b == b'\n')
    }

    /// Drops `len` bytes from the front of the readable span. Draining
    /// everything rewinds both indices to the prependable minimum.
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader_index = Buffer::CHEAP_PREPEND;
        self.writer_index = Buffer::CHEAP_PREPEND;
    }

    /// Removes and returns the first `len` readable bytes.
    pub fn take(&mut self, len: usize) -> Vec<u8> {
        assert!(len <= self.readable_bytes());
        let data = self.peek()[..len].to_vec();
        self.retrieve(len);
        data
    }

    /// Removes and returns the whole readable span.
    pub fn take_all(&mut self) -> Vec<u8> {
        self.take(self.readable_bytes())
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        let start = self.writer_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        assert!(self.writable_bytes() >= len);
    }

    /// Advances the writer index after bytes were placed in the writable
    /// span directly (for example by [`read_fd`](Buffer::read_fd)).
    pub fn has_written(&mut self, len: usize) {
        assert!(len <= self.writable_bytes());
        self.writer_index += len;
    }

    /// Takes back `len` bytes most recently written.
    pub fn unwrite(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        self.writer_index -= len;
    }

    /// Inserts `data` in front of the readable span, consuming prependable
    /// room. Never relocates.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader_index -= data.len();
        let start = self.reader_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
    }

    pub fn append_u16(&mut self, x: u16) {
        self.append(&x.to_be_bytes());
    }

    pub fn append_u32(&mut self, x: u32) {
        self.append(&x.to_be_bytes());
    }

    pub fn append_u64(&mut self, x: u64) {
        self.append(&x.to_be_bytes());
    }

    pub fn prepend_u16(&mut self, x: u16) {
        self.prepend(&x.to_be_bytes());
    }

    pub fn prepend_u32(&mut self, x: u32) {
        self.prepend(&x.to_be_bytes());
    }

    pub fn prepend_u64(&mut self, x: u64) {
        self.prepend(&x.to_be_bytes());
    }

    pub fn peek_u16(&self) -> u16 {
        assert!(self.readable_bytes() >= 2);
        u16::from_be_bytes(self.peek()[..2].try_into().unwrap())
    }

    pub fn peek_u32(&self) -> u32 {
        assert!(self.readable_bytes() >= 4);
        u32::from_be_bytes(self.peek()[..4].try_into().unwrap())
    }

    pub fn peek_u64(&self) -> u64 {
        assert!(self.readable_bytes() >= 8);
        u64::from_be_bytes(self.peek()[..8].try_into().unwrap())
    }

    pub fn read_u16(&mut self) -> u16 {
        let x = self.peek_u16();
        self.retrieve(2);
        x
    }

    pub fn read_u32(&mut self) -> u32 {
        let x = self.peek_u32();
        self.retrieve(4);
        x
    }

    pub fn read_u64(&mut self) -> u64 {
        let x = self.peek_u64();
        self.retrieve(8);
        x
    }

    /// Shrinks the backing storage to the readable span plus `reserve`
    /// writable bytes.
    pub fn shrink(&mut self, reserve: usize) {
        let readable = self.readable_bytes();
        let mut other = Buffer::with_capacity(readable + reserve);
        other.append(self.peek());
        *self = other;
    }

    /// Size of the backing allocation.
    pub fn internal_capacity(&self) -> usize {
        self.buf.len()
    }

    /// Reads from `fd` once with a scatter read: the first io-vector is the
    /// buffer's writable tail, the second a 64 KiB stack spill. Saves the
    /// `FIONREAD` ioctl a sized read would need, and a single `readv(2)`
    /// per readiness keeps level-triggered dispatch fair across
    /// connections.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extrabuf = [0u8; 65536];
        let writable = self.writable_bytes();

        let mut iov = [
            libc::iovec {
                iov_base: self.buf[self.writer_index..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extrabuf.as_mut_ptr() as *mut libc::c_void,
                iov_len: extrabuf.len(),
            },
        ];

        // When the writable tail is already large the stack spill is not
        // needed; with it, a single call moves at most 128 KiB - 1.
        let iovcnt = if writable < extrabuf.len() { 2 } else { 1 };
        let n = syscall!(readv(fd, iov.as_mut_ptr(), iovcnt))? as usize;

        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extrabuf[..n - writable]);
        }
        Ok(n)
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + Buffer::CHEAP_PREPEND {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            // Reclaim the prependable region: shift readable data to the
            // front, leaving the minimum prefix.
            assert!(Buffer::CHEAP_PREPEND < self.reader_index);
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader_index..self.writer_index, Buffer::CHEAP_PREPEND);
            self.reader_index = Buffer::CHEAP_PREPEND;
            self.writer_index = self.reader_index + readable;
            assert_eq!(readable, self.readable_bytes());
        }
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("reader_index", &self.reader_index)
            .field("writer_index", &self.writer_index)
            .field("size", &self.buf.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::Buffer;
    use rand::RngCore;

    #[test]
    fn append_retrieve() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), Buffer::INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND);

        let data = vec![b'x'; 200];
        buf.append(&data);
        assert_eq!(buf.readable_bytes(), 200);
        assert_eq!(buf.writable_bytes(), Buffer::INITIAL_SIZE - 200);
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND);

        let taken = buf.take(50);
        assert_eq!(taken.len(), 50);
        assert_eq!(buf.readable_bytes(), 150);
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND + 50);

        buf.append(&vec![b'y'; 200]);
        assert_eq!(buf.readable_bytes(), 350);

        let rest = buf.take_all();
        assert_eq!(rest.len(), 350);
        assert_eq!(&rest[..150], &vec![b'x'; 150][..]);
        assert_eq!(&rest[150..], &vec![b'y'; 200][..]);
        // Full drain rewinds to the prependable minimum.
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), Buffer::INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND);
    }

    #[test]
    fn grow() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'y'; 400]);
        buf.retrieve(50);

        buf.append(&vec![b'z'; 1000]);
        assert_eq!(buf.readable_bytes(), 1350);
        assert!(buf.internal_capacity() >= Buffer::CHEAP_PREPEND + 1350);

        buf.retrieve_all();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND);
    }

    #[test]
    fn grow_reclaims_prependable_space() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'a'; 800]);
        buf.retrieve(500);
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND + 500);

        // 300 readable + 400 more fits in place once the front is
        // reclaimed; the allocation must not grow.
        let cap = buf.internal_capacity();
        buf.append(&vec![b'b'; 400]);
        assert_eq!(buf.internal_capacity(), cap);
        assert_eq!(buf.readable_bytes(), 700);
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND);
    }

    #[test]
    fn prepend() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'q'; 200]);
        buf.prepend_u32(200);
        assert_eq!(buf.readable_bytes(), 204);
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND - 4);
        assert_eq!(buf.read_u32(), 200);
        assert_eq!(buf.readable_bytes(), 200);
    }

    #[test]
    fn big_endian_integers() {
        let mut buf = Buffer::new();
        buf.append_u64(0x0102_0304_0506_0708);
        buf.append_u32(0x1122_3344);
        buf.append_u16(0x5566);
        assert_eq!(buf.readable_bytes(), 14);
        assert_eq!(buf.peek()[0], 0x01);
        assert_eq!(buf.read_u64(), 0x0102_0304_0506_0708);
        assert_eq!(buf.read_u32(), 0x1122_3344);
        assert_eq!(buf.read_u16(), 0x5566);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn find_eol_and_crlf() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost: example\n");
        assert_eq!(buf.find_crlf(), Some(14));
        assert_eq!(buf.find_eol(), Some(15));
        buf.retrieve(16);
        assert_eq!(buf.find_crlf(), None);
        assert_eq!(buf.find_eol(), Some(13));
    }

    #[test]
    fn shrink() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'y'; 2000]);
        buf.retrieve(1500);
        buf.shrink(16);
        assert_eq!(buf.readable_bytes(), 500);
        assert_eq!(buf.peek(), &vec![b'y'; 500][..]);
        assert!(buf.internal_capacity() <= Buffer::CHEAP_PREPEND + 500 + 16);
    }

    #[test]
    fn read_fd_within_writable_tail() {
        let mut fds = [0; 2];
        syscall!(pipe(fds.as_mut_ptr())).unwrap();
        let payload = b"hello pipe";
        let n = unsafe {
            libc::write(
                fds[1],
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
            )
        };
        assert_eq!(n as usize, payload.len());

        let mut buf = Buffer::new();
        let n = buf.read_fd(fds[0]).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(buf.peek(), payload);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn read_fd_spills_past_writable_tail() {
        let mut fds = [0; 2];
        syscall!(pipe(fds.as_mut_ptr())).unwrap();

        let mut payload = vec![0u8; 4000];
        rand::rng().fill_bytes(&mut payload);
        let n = unsafe {
            libc::write(
                fds[1],
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
            )
        };
        assert_eq!(n as usize, payload.len());

        // 1024 writable bytes force the tail of the read through the stack
        // spill and a grow.
        let mut buf = Buffer::new();
        let n = buf.read_fd(fds[0]).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(buf.peek(), &payload[..]);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
