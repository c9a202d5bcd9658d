use std::{
    collections::VecDeque,
    io,
    os::fd::{AsRawFd, OwnedFd, RawFd},
};

use crate::buffer::{Buffer, PAGE_SIZE};

/// Socket-facing read side of a connection: one paged buffer fed by
/// `readv`.
pub struct InputStream {
    fd: RawFd,
    buffer: Buffer,
}

impl InputStream {
    pub fn new(fd: RawFd) -> Self {
        Self { fd, buffer: Buffer::new() }
    }

    pub fn read_into_buffer(&mut self) -> io::Result<usize> {
        self.buffer.read_from_fd(self.fd)
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut Buffer {
        &mut self.buffer
    }

    pub fn close(&mut self) {
        self.buffer.clear();
    }
}

/// A contiguous byte range of an open file, pushed through the socket with
/// the platform zero-copy primitive. Owns the descriptor; dropping the range
/// closes the file.
pub struct FileRange {
    file: OwnedFd,
    offset: i64,
    remaining: i64,
}

impl FileRange {
    /// `length < 0` means from `offset` to end of file, resolved against
    /// fstat at construction.
    pub fn new(file: OwnedFd, offset: i64, length: i64) -> io::Result<Self> {
        let remaining = if length < 0 {
            let mut st = unsafe { std::mem::zeroed::<libc::stat>() };
            if unsafe { libc::fstat(file.as_raw_fd(), &mut st) } < 0 {
                return Err(io::Error::last_os_error());
            }
            st.st_size - offset
        } else {
            length
        };
        Ok(Self { file, offset, remaining: remaining.max(0) })
    }

    pub fn remaining(&self) -> i64 {
        self.remaining
    }

    fn is_done(&self) -> bool {
        self.remaining <= 0
    }

    #[cfg(target_os = "linux")]
    fn send_chunk(&mut self, out_fd: RawFd, chunk: usize) -> io::Result<usize> {
        let n = unsafe { libc::sendfile64(out_fd, self.file.as_raw_fd(), &mut self.offset, chunk) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    #[cfg(target_os = "macos")]
    fn send_chunk(&mut self, out_fd: RawFd, chunk: usize) -> io::Result<usize> {
        let mut len = chunk as libc::off_t;
        let rc = unsafe {
            libc::sendfile(
                self.file.as_raw_fd(),
                out_fd,
                self.offset as libc::off_t,
                &mut len,
                std::ptr::null_mut(),
                0,
            )
        };
        // BSD sendfile reports partial progress through `len` even on EAGAIN.
        if rc < 0 && len == 0 {
            return Err(io::Error::last_os_error());
        }
        self.offset += len as i64;
        Ok(len as usize)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn send_chunk(&mut self, out_fd: RawFd, chunk: usize) -> io::Result<usize> {
        let mut page = [0u8; PAGE_SIZE];
        let nread = unsafe {
            libc::pread(
                self.file.as_raw_fd(),
                page.as_mut_ptr().cast::<libc::c_void>(),
                chunk.min(PAGE_SIZE),
                self.offset,
            )
        };
        if nread < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = unsafe { libc::write(out_fd, page.as_ptr().cast::<libc::c_void>(), nread as usize) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        self.offset += n;
        Ok(n as usize)
    }

    fn write_to_fd(&mut self, out_fd: RawFd) -> io::Result<usize> {
        let chunk = (self.remaining as usize).min(PAGE_SIZE);
        let n = self.send_chunk(out_fd, chunk)?;
        self.remaining -= n as i64;
        Ok(n)
    }
}

enum Sink {
    Data(Buffer),
    File(FileRange),
}

/// Ordered queue of sinks drained head-first into one socket. In-memory
/// accounting covers Data sinks only; file ranges never occupy user memory.
pub struct OutputStream {
    fd: RawFd,
    sinks: VecDeque<Sink>,
    memory_usage: usize,
}

impl OutputStream {
    pub fn new(fd: RawFd) -> Self {
        Self { fd, sinks: VecDeque::new(), memory_usage: 0 }
    }

    pub fn is_done(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn memory_usage(&self) -> usize {
        self.memory_usage
    }

    /// Appends bytes, coalescing into the tail sink when it is a buffer.
    pub fn append_data(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        match self.sinks.back_mut() {
            Some(Sink::Data(buf)) => buf.append(data),
            _ => {
                let mut buf = Buffer::new();
                buf.append(data);
                self.sinks.push_back(Sink::Data(buf));
            }
        }
        self.memory_usage += data.len();
    }

    /// Pushes a logical copy of `buf` as its own sink (copy-on-write; no
    /// bytes move until one side mutates).
    pub fn append_buffer(&mut self, buf: &Buffer) {
        if buf.is_empty() {
            return;
        }
        self.memory_usage += buf.size();
        self.sinks.push_back(Sink::Data(buf.clone()));
    }

    /// Pushes a file range sink; returns the resolved byte length.
    pub fn append_file(&mut self, file: OwnedFd, offset: i64, length: i64) -> io::Result<i64> {
        let range = FileRange::new(file, offset, length)?;
        let resolved = range.remaining();
        self.sinks.push_back(Sink::File(range));
        Ok(resolved)
    }

    /// Drains the head sink once. `Ok(0)` with sinks remaining means the head
    /// made no progress this round; `Ok(0)` with none remaining means done.
    pub fn write_into_output(&mut self) -> io::Result<usize> {
        let Some(head) = self.sinks.front_mut() else {
            return Ok(0);
        };
        let (n, drained) = match head {
            Sink::Data(buf) => {
                let n = buf.write_to_fd(self.fd)?;
                self.memory_usage -= n;
                (n, buf.is_empty())
            }
            Sink::File(range) => {
                let n = range.write_to_fd(self.fd)?;
                (n, range.is_done())
            }
        };
        if drained {
            self.sinks.pop_front();
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        io::Read,
        os::{
            fd::{AsRawFd, OwnedFd},
            unix::net::UnixStream,
        },
    };

    use super::*;

    fn drain_all(out: &mut OutputStream) {
        while !out.is_done() {
            out.write_into_output().expect("drain");
        }
    }

    #[test]
    fn memory_usage_counts_only_data_sinks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("payload");
        fs::write(&path, vec![1u8; 4096]).expect("fixture");
        let file: OwnedFd = fs::File::open(&path).expect("open").into();

        let (_a, b) = UnixStream::pair().expect("socketpair");
        let mut out = OutputStream::new(b.as_raw_fd());
        out.append_data(b"0123456789");
        let resolved = out.append_file(file, 0, -1).expect("append_file");
        assert_eq!(resolved, 4096);
        out.append_data(b"tail");

        assert_eq!(out.memory_usage(), 14);
        assert!(!out.is_done());
    }

    #[test]
    fn append_data_coalesces_into_tail_buffer() {
        let (_a, b) = UnixStream::pair().expect("socketpair");
        let mut out = OutputStream::new(b.as_raw_fd());
        out.append_data(b"hello ");
        out.append_data(b"world");
        assert_eq!(out.memory_usage(), 11);
        // both writes live in one sink, so one full drain empties the stream
        out.write_into_output().expect("drain");
        assert!(out.is_done());
    }

    #[test]
    fn sinks_drain_in_order_including_file_ranges() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("f");
        fs::write(&path, b"0123456789").expect("fixture");
        let file: OwnedFd = fs::File::open(&path).expect("open").into();

        let (mut rx, tx) = UnixStream::pair().expect("socketpair");
        let mut out = OutputStream::new(tx.as_raw_fd());
        out.append_data(b"head:");
        out.append_file(file, 2, 5).expect("append_file");
        out.append_data(b":tail");

        drain_all(&mut out);
        assert_eq!(out.memory_usage(), 0);
        drop(tx);

        let mut got = Vec::new();
        rx.read_to_end(&mut got).expect("read back");
        assert_eq!(got, b"head:23456:tail");
    }

    #[test]
    fn negative_length_resolves_to_eof() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("f");
        fs::write(&path, b"abcdefgh").expect("fixture");
        let file: OwnedFd = fs::File::open(&path).expect("open").into();
        let range = FileRange::new(file, 3, -1).expect("range");
        assert_eq!(range.remaining(), 5);
    }

    #[test]
    fn appended_buffer_snapshot_is_isolated_from_later_mutation() {
        let (mut rx, tx) = UnixStream::pair().expect("socketpair");
        let mut out = OutputStream::new(tx.as_raw_fd());

        let mut prepare = Buffer::new();
        prepare.append(b"response-body");
        out.append_buffer(&prepare);
        prepare.clear();
        prepare.append(b"recycled");

        drain_all(&mut out);
        drop(tx);

        let mut got = Vec::new();
        rx.read_to_end(&mut got).expect("read back");
        assert_eq!(got, b"response-body");
    }
}
