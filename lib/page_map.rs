//! Byte-range bookkeeping for one open file.
//!
//! A [`PageMap`] is an ordered list of pages covering `[0, size)` without
//! gaps or overlap. Each page carries `(loaded, modified)` flags; adjacent
//! pages with equal flags are coalesced after every mutation, so the list
//! stays minimal. Holes in a sparse file are unloaded, unmodified pages.

/// A half-open byte range `[offset, offset + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub len: u64,
}

impl ByteRange {
    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Intersection with another range, if non-empty.
    pub fn intersect(&self, other: &ByteRange) -> Option<ByteRange> {
        let start = self.offset.max(other.offset);
        let end = self.end().min(other.end());
        (start < end).then(|| ByteRange::new(start, end - start))
    }

    /// Split into chunks of at most `chunk` bytes.
    pub fn chunks(&self, chunk: u64) -> Vec<ByteRange> {
        assert!(chunk > 0, "chunk size must be positive");
        let mut out = Vec::new();
        let mut off = self.offset;
        while off < self.end() {
            let len = chunk.min(self.end() - off);
            out.push(ByteRange::new(off, len));
            off += len;
        }
        out
    }
}

/// One tracked page: a byte range plus load/dirty state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: u64,
    pub len: u64,
    pub loaded: bool,
    pub modified: bool,
}

impl Page {
    fn end(&self) -> u64 {
        self.offset + self.len
    }

    fn flags(&self) -> (bool, bool) {
        (self.loaded, self.modified)
    }
}

/// Ordered, coalesced page list covering `[0, size)`.
#[derive(Debug, Clone, Default)]
pub struct PageMap {
    pages: Vec<Page>,
    size: u64,
}

impl PageMap {
    /// A map for a file of `size` bytes, initially fully unloaded.
    pub fn new(size: u64) -> Self {
        let mut map = Self {
            pages: Vec::new(),
            size: 0,
        };
        map.resize(size);
        map
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    /// Sub-ranges of `range` whose bytes are not loaded. No state change.
    ///
    /// The caller fetches each sub-range and reports completion through
    /// [`mark_loaded`](Self::mark_loaded).
    pub fn unloaded_ranges(&self, range: ByteRange) -> Vec<ByteRange> {
        let clamped = ByteRange::new(range.offset, range.len.min(self.size.saturating_sub(range.offset)));
        if clamped.is_empty() {
            return Vec::new();
        }
        let mut out: Vec<ByteRange> = Vec::new();
        for page in &self.pages {
            if page.loaded {
                continue;
            }
            let Some(overlap) = clamped.intersect(&ByteRange::new(page.offset, page.len)) else {
                continue;
            };
            match out.last_mut() {
                Some(prev) if prev.end() == overlap.offset => prev.len += overlap.len,
                _ => out.push(overlap),
            }
        }
        out
    }

    /// Minimal cover of all modified bytes; no two returned ranges touch.
    pub fn modified_ranges(&self) -> Vec<ByteRange> {
        let mut out: Vec<ByteRange> = Vec::new();
        for page in &self.pages {
            if !page.modified {
                continue;
            }
            let r = ByteRange::new(page.offset, page.len);
            match out.last_mut() {
                Some(prev) if prev.end() == r.offset => prev.len += r.len,
                _ => out.push(r),
            }
        }
        out
    }

    /// True when every byte of the file is marked modified.
    pub fn fully_modified(&self) -> bool {
        self.size == 0 || self.pages.iter().all(|p| p.modified)
    }

    /// Mark `range` as present in the staging file. Idempotent; extends the
    /// file if `range` reaches past the current size.
    pub fn mark_loaded(&mut self, range: ByteRange) {
        self.apply(range, |p| p.loaded = true);
    }

    /// Mark `range` as locally written: loaded and modified.
    pub fn mark_modified(&mut self, range: ByteRange) {
        self.apply(range, |p| {
            p.loaded = true;
            p.modified = true;
        });
    }

    /// Drop all modified flags (after a successful upload). Loaded state is
    /// kept: the staging bytes still mirror the object.
    pub fn clear_modified(&mut self) {
        for p in &mut self.pages {
            p.modified = false;
        }
        self.coalesce_all();
    }

    /// Change the logical file size.
    ///
    /// Growing appends an unloaded, unmodified hole. Shrinking drops pages
    /// beyond `new_size`, splitting a straddling page.
    pub fn resize(&mut self, new_size: u64) {
        use std::cmp::Ordering;
        match new_size.cmp(&self.size) {
            Ordering::Equal => {}
            Ordering::Greater => {
                let hole = Page {
                    offset: self.size,
                    len: new_size - self.size,
                    loaded: false,
                    modified: false,
                };
                match self.pages.last_mut() {
                    Some(last) if last.flags() == hole.flags() => last.len += hole.len,
                    _ => self.pages.push(hole),
                }
                self.size = new_size;
            }
            Ordering::Less => {
                self.pages.retain(|p| p.offset < new_size);
                if let Some(last) = self.pages.last_mut()
                    && last.end() > new_size
                {
                    last.len = new_size - last.offset;
                }
                self.size = new_size;
            }
        }
    }

    fn apply(&mut self, range: ByteRange, f: impl Fn(&mut Page)) {
        if range.is_empty() {
            return;
        }
        if range.end() > self.size {
            self.resize(range.end());
        }

        // Locate the affected span, split at both boundaries, apply, coalesce.
        let start_idx = self.split_at(range.offset);
        let end_idx = self.split_at(range.end());
        for page in &mut self.pages[start_idx..end_idx] {
            f(page);
        }
        self.coalesce_around(start_idx, end_idx);
    }

    /// Ensure a page boundary exists at `pos`; returns the index of the page
    /// starting at `pos` (or `pages.len()` when `pos == size`).
    fn split_at(&mut self, pos: u64) -> usize {
        if pos == self.size {
            return self.pages.len();
        }
        let idx = self
            .pages
            .partition_point(|p| p.end() <= pos);
        let page = self.pages[idx];
        if page.offset == pos {
            return idx;
        }
        let head_len = pos - page.offset;
        self.pages[idx].len = head_len;
        self.pages.insert(
            idx + 1,
            Page {
                offset: pos,
                len: page.len - head_len,
                ..page
            },
        );
        idx + 1
    }

    /// Coalesce equal-flag neighbours in `[start.saturating_sub(1), end]`.
    fn coalesce_around(&mut self, start: usize, end: usize) {
        let mut i = start.saturating_sub(1);
        let mut stop = end.min(self.pages.len().saturating_sub(1));
        while i < stop {
            if self.pages[i].flags() == self.pages[i + 1].flags() {
                self.pages[i].len += self.pages[i + 1].len;
                self.pages.remove(i + 1);
                stop -= 1;
            } else {
                i += 1;
            }
        }
    }

    fn coalesce_all(&mut self) {
        if self.pages.is_empty() {
            return;
        }
        let len = self.pages.len();
        self.coalesce_around(1, len);
    }

    /// Debug check of the structural invariants: contiguous cover of
    /// `[0, size)` with no equal-flag neighbours.
    #[cfg(test)]
    fn check_invariants(&self) {
        let mut cursor = 0;
        for (i, p) in self.pages.iter().enumerate() {
            assert_eq!(p.offset, cursor, "pages must be contiguous");
            assert!(p.len > 0, "pages must be non-empty");
            if i > 0 {
                assert_ne!(
                    self.pages[i - 1].flags(),
                    p.flags(),
                    "equal-flag neighbours must be coalesced"
                );
            }
            cursor = p.end();
        }
        assert_eq!(cursor, self.size, "pages must cover [0, size)");
    }
}
