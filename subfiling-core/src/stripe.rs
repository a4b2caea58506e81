// vim: tw=80
//! Translation between the logical address space and subfile addresses
//!
//! The logical file is divided into stripes of `stripe_size` bytes, which are
//! dealt out round-robin to the subfiles.  One full pass over every subfile is
//! a "block".  Row `r` of subfile `k` holds logical stripe `r * N + k`, and
//! lives at subfile offset `r * stripe_size`.

use serde_derive::{Deserialize, Serialize};
use crate::types::*;

/// The striping parameters of a logical file
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StripeGeometry {
    stripe_size: u64,
    num_subfiles: usize,
}

/// One contiguous piece of a logical I/O request, wholly within one stripe of
/// one subfile (or, with a single subfile, a contiguous run of stripes)
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Segment {
    pub subfile: SubfileIdx,
    /// Offset within the subfile
    pub subfile_offset: u64,
    /// Offset within the logical file
    pub logical_offset: u64,
    pub len: u64,
    /// Offset of this segment within the caller's buffer
    pub mem_offset: usize,
}

/// Where a request begins and ends, in stripe terms
#[derive(Clone, Copy, Debug)]
struct Extent {
    offset: u64,
    len: u64,
    /// Row of the first stripe
    first_row: u64,
    /// Row of the last stripe
    last_row: u64,
    first_sf: SubfileIdx,
    last_sf: SubfileIdx,
    /// Length of the first segment
    start_len: u64,
    /// Length of the last segment, if it's not also the first
    final_len: u64,
    final_stripe: u64,
}

impl StripeGeometry {
    pub fn new(stripe_size: u64, num_subfiles: usize) -> Result<Self> {
        if stripe_size == 0 || num_subfiles == 0 {
            return Err(Error::EINVAL);
        }
        Ok(StripeGeometry{stripe_size, num_subfiles})
    }

    pub fn stripe_size(&self) -> u64 {
        self.stripe_size
    }

    pub fn num_subfiles(&self) -> usize {
        self.num_subfiles
    }

    /// Logical bytes in one pass over every subfile
    pub fn block_size(&self) -> u64 {
        self.stripe_size * self.num_subfiles as u64
    }

    /// The subfile holding a logical offset
    pub fn subfile_of(&self, offset: u64) -> SubfileIdx {
        ((offset / self.stripe_size) % self.num_subfiles as u64) as SubfileIdx
    }

    /// Translate a logical offset to an offset within its subfile
    pub fn subfile_offset(&self, offset: u64) -> u64 {
        let stripe = offset / self.stripe_size;
        let row = stripe / self.num_subfiles as u64;
        row * self.stripe_size + offset % self.stripe_size
    }

    /// Translate a subfile address back to a logical offset
    pub fn logical_offset(&self, subfile: SubfileIdx, subfile_offset: u64)
        -> u64
    {
        let row = subfile_offset / self.stripe_size;
        let stripe = row * self.num_subfiles as u64 + subfile as u64;
        stripe * self.stripe_size + subfile_offset % self.stripe_size
    }

    /// The logical end of file implied by one subfile's size.  The real end of
    /// file is the maximum over all subfiles.
    pub fn logical_eof(&self, subfile: SubfileIdx, subfile_size: u64) -> u64 {
        if subfile_size == 0 {
            return 0;
        }
        let full_rows = subfile_size / self.stripe_size;
        let partial = subfile_size % self.stripe_size;
        let block = self.block_size();
        let sf_start = subfile as u64 * self.stripe_size;
        if partial == 0 {
            (full_rows - 1) * block + sf_start + self.stripe_size
        } else {
            full_rows * block + sf_start + partial
        }
    }

    /// Size that `subfile` must have to hold a logical file of exactly
    /// `logical_len` bytes
    pub fn subfile_len(&self, subfile: SubfileIdx, logical_len: u64) -> u64 {
        let s = self.stripe_size;
        let block = self.block_size();
        let rem = logical_len % block;
        let start = subfile as u64 * s;
        (logical_len / block) * s + rem.saturating_sub(start).min(s)
    }

    fn extent(&self, offset: u64, len: u64) -> Extent {
        debug_assert!(len > 0);
        let s = self.stripe_size;
        let n = self.num_subfiles as u64;
        let stripe = offset / s;
        let offset_in_stripe = offset % s;
        let final_offset = offset + len - 1;
        let final_stripe = final_offset / s;
        let start_len = len.min(s - offset_in_stripe);
        let final_len = if start_len == len {
            0
        } else if (final_offset + 1) % s == 0 {
            s
        } else {
            (final_offset + 1) % s
        };
        Extent {
            offset,
            len,
            first_row: stripe / n,
            last_row: final_stripe / n,
            first_sf: (stripe % n) as SubfileIdx,
            last_sf: (final_stripe % n) as SubfileIdx,
            start_len,
            final_len,
            final_stripe,
        }
    }

    /// The maximum number of segments that any one subfile receives for
    /// this request
    fn depth(&self, ext: &Extent) -> u64 {
        let depth = ext.last_row - ext.first_row + 1;
        if ext.last_sf < ext.first_sf {
            depth - 1
        } else {
            depth
        }
    }

    /// The range of rows of subfile `k` touched by the request, as a
    /// half-open range
    fn rows(&self, ext: &Extent, k: SubfileIdx) -> (u64, u64) {
        let first = if k >= ext.first_sf {
            ext.first_row
        } else {
            ext.first_row + 1
        };
        let end = if k <= ext.last_sf {
            ext.last_row + 1
        } else {
            ext.last_row
        };
        (first, end.max(first))
    }

    fn full_stripe(&self, ext: &Extent, k: SubfileIdx, row: u64) -> Segment {
        let s = self.stripe_size;
        let logical_offset = (row * self.num_subfiles as u64 + k as u64) * s;
        Segment {
            subfile: k,
            subfile_offset: row * s,
            logical_offset,
            len: s,
            mem_offset: (logical_offset - ext.offset) as usize
        }
    }

    fn first_segment(&self, ext: &Extent) -> Segment {
        Segment {
            subfile: ext.first_sf,
            subfile_offset: self.subfile_offset(ext.offset),
            logical_offset: ext.offset,
            len: ext.start_len,
            mem_offset: 0
        }
    }

    fn last_segment(&self, ext: &Extent) -> Segment {
        let logical_offset = ext.final_stripe * self.stripe_size;
        Segment {
            subfile: ext.last_sf,
            subfile_offset: ext.last_row * self.stripe_size,
            logical_offset,
            len: ext.final_len,
            mem_offset: (logical_offset - ext.offset) as usize
        }
    }

    /// Fill the segments for the subfile holding the request's first byte but
    /// not its last.  It gets a possibly-partial leading segment, followed by
    /// full stripes.
    fn fill_first(&self, ext: &Extent, v: &mut Vec<Segment>) {
        let (first, end) = self.rows(ext, ext.first_sf);
        v.push(self.first_segment(ext));
        for row in (first + 1)..end {
            v.push(self.full_stripe(ext, ext.first_sf, row));
        }
    }

    /// Fill the segments for the subfile holding the request's last byte but
    /// not its first.  It gets full stripes followed by a possibly-partial
    /// trailing segment.
    fn fill_last(&self, ext: &Extent, v: &mut Vec<Segment>) {
        let (first, end) = self.rows(ext, ext.last_sf);
        for row in first..(end - 1) {
            v.push(self.full_stripe(ext, ext.last_sf, row));
        }
        v.push(self.last_segment(ext));
    }

    /// Fill the segments for a subfile that holds both the first and the last
    /// byte of the request.
    fn fill_first_last(&self, ext: &Extent, v: &mut Vec<Segment>) {
        if ext.final_len == 0 {
            // The whole request lies within a single stripe
            v.push(self.first_segment(ext));
            return;
        }
        let (first, end) = self.rows(ext, ext.first_sf);
        v.push(self.first_segment(ext));
        for row in (first + 1)..(end - 1) {
            v.push(self.full_stripe(ext, ext.first_sf, row));
        }
        v.push(self.last_segment(ext));
    }

    /// Fill the segments for a subfile touched only in the interior of the
    /// request.  Every segment is a full stripe, one block apart in the logical
    /// address space.
    fn fill_uniform(&self, ext: &Extent, k: SubfileIdx, v: &mut Vec<Segment>) {
        let (first, end) = self.rows(ext, k);
        for row in first..end {
            v.push(self.full_stripe(ext, k, row));
        }
    }

    /// Split a logical I/O request into per-subfile segments.
    ///
    /// The segments are returned in logical order, so they exactly tile the
    /// caller's buffer.  A zero-length request produces no segments.
    pub fn split(&self, offset: u64, len: u64) -> Vec<Segment> {
        if len == 0 {
            return Vec::new();
        }
        let ext = self.extent(offset, len);
        if self.num_subfiles == 1 {
            return self.split_single(&ext);
        }
        let depth = self.depth(&ext);
        let mut segments = Vec::new();
        for k in 0..self.num_subfiles {
            let before = segments.len();
            if k == ext.first_sf && k == ext.last_sf {
                self.fill_first_last(&ext, &mut segments);
            } else if k == ext.first_sf {
                self.fill_first(&ext, &mut segments);
            } else if k == ext.last_sf {
                self.fill_last(&ext, &mut segments);
            } else {
                self.fill_uniform(&ext, k, &mut segments);
            }
            debug_assert!((segments.len() - before) as u64 <= depth,
                "subfile {} received more than {} segments", k, depth);
        }
        segments.sort_unstable_by_key(|s| s.logical_offset);
        let total: u64 = segments.iter().map(|s| s.len).sum();
        assert_eq!(total, len, "Stripe translation lost bytes");
        segments
    }

    /// With a single subfile, addresses translate one-to-one.  Keep an
    /// unaligned head separate and coalesce everything after it.
    fn split_single(&self, ext: &Extent) -> Vec<Segment> {
        let head = self.first_segment(ext);
        if head.len == ext.len || ext.offset % self.stripe_size == 0 {
            return vec![Segment{len: ext.len, ..head}];
        }
        let rest = ext.offset + head.len;
        vec![head, Segment {
            subfile: 0,
            subfile_offset: rest,
            logical_offset: rest,
            len: ext.len - head.len,
            mem_offset: head.len as usize
        }]
    }

    /// Split a write request, slicing the caller's buffer to match each
    /// segment
    pub fn split_write(&self, offset: u64, buf: &IoVec)
        -> Vec<(Segment, IoVec)>
    {
        self.split(offset, buf.len() as u64)
            .into_iter()
            .map(|seg| {
                let end = seg.mem_offset + seg.len as usize;
                (seg, buf.slice(seg.mem_offset, end))
            }).collect()
    }

    /// Split a read request, carving the caller's buffer into one destination
    /// per segment
    pub fn split_read(&self, offset: u64, mut buf: IoVecMut)
        -> Vec<(Segment, IoVecMut)>
    {
        self.split(offset, buf.len() as u64)
            .into_iter()
            .map(|seg| (seg, buf.split_to(seg.len as usize)))
            .collect()
    }
}

// LCOV_EXCL_STOP
