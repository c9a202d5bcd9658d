use std::{collections::VecDeque, io, mem, os::fd::RawFd, sync::Arc};

/// Fixed page granularity for the paged buffer. Scatter reads always offer
/// the kernel one spare page beyond the current tail.
pub const PAGE_SIZE: usize = 8192;

struct Page(Box<[u8; PAGE_SIZE]>);

impl Page {
    fn new() -> Self {
        Self(Box::new([0; PAGE_SIZE]))
    }
}

impl Clone for Page {
    fn clone(&self) -> Self {
        Self(Box::new(*self.0))
    }
}

#[derive(Clone)]
struct BufferInner {
    pages: VecDeque<Page>,
    /// Consumed bytes at the head of the first page.
    left: usize,
    /// Free bytes at the tail of the last page.
    right: usize,
    size: usize,
}

impl BufferInner {
    fn new() -> Self {
        let mut pages = VecDeque::new();
        pages.push_back(Page::new());
        Self { pages, left: 0, right: PAGE_SIZE, size: 0 }
    }
}

/// Paged byte container for streaming I/O: O(1) append at the tail, O(1) pop
/// at the head, two-entry scatter/gather against a file descriptor.
///
/// Cloning is cheap: the page list is shared until either side mutates, at
/// which point the mutating side deep-copies it first. A clone therefore
/// behaves as if it had been independent from creation. The preallocated
/// extra page is never shared; each buffer keeps its own so a scatter read
/// always has a full spare page to spill into.
pub struct Buffer {
    inner: Arc<BufferInner>,
    extra: Page,
}

impl Buffer {
    pub fn new() -> Self {
        Self { inner: Arc::new(BufferInner::new()), extra: Page::new() }
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn is_empty(&self) -> bool {
        self.inner.size == 0
    }

    pub fn append(&mut self, mut data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let inner = Arc::make_mut(&mut self.inner);
        inner.size += data.len();

        let tail_start = PAGE_SIZE - inner.right;
        let take = data.len().min(inner.right);
        if let Some(tail) = inner.pages.back_mut() {
            tail.0[tail_start..tail_start + take].copy_from_slice(&data[..take]);
        }
        inner.right -= take;
        data = &data[take..];

        while !data.is_empty() {
            let mut page = Page::new();
            let take = data.len().min(PAGE_SIZE);
            page.0[..take].copy_from_slice(&data[..take]);
            inner.pages.push_back(page);
            inner.right = PAGE_SIZE - take;
            data = &data[take..];
        }
    }

    /// Drops `n` bytes from the head. Popping more than `size` pops nothing
    /// and reports failure.
    pub fn pop(&mut self, n: usize) -> bool {
        if self.inner.size < n {
            return false;
        }
        if n == 0 {
            return true;
        }
        let inner = Arc::make_mut(&mut self.inner);
        let consumed = inner.left + n;
        let full_pages = consumed / PAGE_SIZE;
        inner.left = consumed % PAGE_SIZE;
        for _ in 0..full_pages {
            if inner.pages.len() > 1 {
                inner.pages.pop_front();
            }
        }
        inner.size -= n;
        if inner.size == 0 {
            inner.left = 0;
            inner.right = PAGE_SIZE;
        }
        true
    }

    pub fn clear(&mut self) {
        self.pop(self.size());
    }

    /// Copies the first `dst.len()` bytes into `dst` without consuming them.
    /// Fails if fewer bytes are buffered.
    pub fn copy_front(&self, dst: &mut [u8]) -> bool {
        let n = dst.len();
        if self.inner.size < n {
            return false;
        }
        let mut copied = 0;
        for seg in self.segments() {
            if copied == n {
                break;
            }
            let take = (n - copied).min(seg.len());
            dst[copied..copied + take].copy_from_slice(&seg[..take]);
            copied += take;
        }
        copied == n
    }

    /// Live portion of each page, head and tail offsets applied.
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> {
        let inner = &*self.inner;
        let last = inner.pages.len() - 1;
        inner
            .pages
            .iter()
            .enumerate()
            .map(move |(i, page)| {
                let start = if i == 0 { inner.left } else { 0 };
                let end = if i == last { PAGE_SIZE - inner.right } else { PAGE_SIZE };
                &page.0[start..end]
            })
            .filter(|seg| !seg.is_empty())
    }

    /// Two-entry scatter read: the free tail of the last page first, then the
    /// spare page. If the read spills past the tail, the spare page becomes
    /// the new last page and a fresh spare is allocated.
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let inner = Arc::make_mut(&mut self.inner);
        let right = inner.right;
        let tail_start = PAGE_SIZE - right;
        let tail = inner.pages.back_mut().map_or(std::ptr::null_mut(), |p| p.0.as_mut_ptr());

        let iov = [
            libc::iovec {
                iov_base: unsafe { tail.add(tail_start) }.cast::<libc::c_void>(),
                iov_len: right,
            },
            libc::iovec {
                iov_base: self.extra.0.as_mut_ptr().cast::<libc::c_void>(),
                iov_len: PAGE_SIZE,
            },
        ];
        let n = unsafe { libc::readv(fd, iov.as_ptr(), 2) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n >= right {
            inner.right = PAGE_SIZE + right - n;
            inner.pages.push_back(mem::replace(&mut self.extra, Page::new()));
        } else {
            inner.right -= n;
        }
        inner.size += n;
        Ok(n)
    }

    /// Gather write of up to the two leading pages; pops what the kernel
    /// accepted.
    pub fn write_to_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        if self.inner.size == 0 {
            return Ok(0);
        }
        let inner = &*self.inner;
        let last = inner.pages.len() - 1;
        let nvec = inner.pages.len().min(2);
        let mut iov = [libc::iovec { iov_base: std::ptr::null_mut(), iov_len: 0 }; 2];
        for (i, page) in inner.pages.iter().take(nvec).enumerate() {
            let start = if i == 0 { inner.left } else { 0 };
            let end = if i == last { PAGE_SIZE - inner.right } else { PAGE_SIZE };
            iov[i] = libc::iovec {
                iov_base: page.0[start..].as_ptr().cast_mut().cast::<libc::c_void>(),
                iov_len: end - start,
            };
        }
        let n = unsafe { libc::writev(fd, iov.as_ptr(), nvec as libc::c_int) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        self.pop(n as usize);
        Ok(n as usize)
    }
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner), extra: Page::new() }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.inner.size)
            .field("pages", &self.inner.pages.len())
            .finish()
    }
}
