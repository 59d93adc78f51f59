//! Tracks which DMA buffers are currently imported into a device.
//!
//! Decoders recycle a small set of DMA buffers; the display and graphics
//! engine must import each buffer exactly once and drop the import when the
//! decoder reallocates (signalled by a new frame id on the same fds).

use log::{debug, warn};
use std::collections::HashMap;

use crate::core::{PixelFormat, Result, VideoBuf};

/// A device able to import DMA buffers by fd.
pub trait DmaImporter {
    fn add_dmabuf(&mut self, fd: i32) -> Result<()>;

    fn rm_dmabuf(&mut self, fd: i32) -> Result<()>;
}

/// Canonical identity of a multi-plane buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferKey {
    pub format: PixelFormat,
    pub fds: [i32; 3],
}

impl BufferKey {
    pub fn of(buf: &VideoBuf) -> Self {
        let mut fds = [-1; 3];
        let planes = buf.plane_fds();
        fds[..planes.len()].copy_from_slice(planes);
        Self {
            format: buf.format,
            fds,
        }
    }

    fn planes(&self) -> impl Iterator<Item = i32> + '_ {
        self.fds[..self.format.plane_count()].iter().copied()
    }
}

#[derive(Debug, Default)]
pub struct DmaImportTable {
    entries: HashMap<BufferKey, u32>,
}

impl DmaImportTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn frame_id(&self, buf: &VideoBuf) -> Option<u32> {
        self.entries.get(&BufferKey::of(buf)).copied()
    }

    /// Makes sure `buf` is imported under `frame_id`.
    pub fn ensure<I>(&mut self, frame_id: u32, buf: &VideoBuf, importer: &mut I) -> Result<()>
    where
        I: DmaImporter + ?Sized,
    {
        let key = BufferKey::of(buf);
        match self.entries.get(&key) {
            Some(&cached) if cached == frame_id => return Ok(()),
            Some(&cached) => {
                debug!(
                    "dma buffer {:?} reallocated: id {} -> {}",
                    key.fds, cached, frame_id
                );
                self.entries.remove(&key);
                release(&key, importer);
            }
            None => {}
        }

        let mut added = Vec::with_capacity(3);
        for fd in key.planes() {
            if let Err(e) = importer.add_dmabuf(fd) {
                for fd in added {
                    if let Err(rm) = importer.rm_dmabuf(fd) {
                        warn!("rollback rm dmabuf {} failed: {}", fd, rm);
                    }
                }
                return Err(e);
            }
            added.push(fd);
        }
        self.entries.insert(key, frame_id);
        Ok(())
    }

    /// Removes every tracked import.
    pub fn clear<I>(&mut self, importer: &mut I)
    where
        I: DmaImporter + ?Sized,
    {
        for (key, _) in self.entries.drain() {
            release(&key, importer);
        }
    }
}

fn release<I: DmaImporter + ?Sized>(key: &BufferKey, importer: &mut I) {
    for fd in key.planes() {
        if let Err(e) = importer.rm_dmabuf(fd) {
            warn!("rm dmabuf {} failed: {}", fd, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MppError, Size};

    #[derive(Default)]
    struct Recorder {
        adds: Vec<i32>,
        removes: Vec<i32>,
        fail_fd: Option<i32>,
        fail_rm: Option<i32>,
    }

    impl DmaImporter for Recorder {
        fn add_dmabuf(&mut self, fd: i32) -> Result<()> {
            if self.fail_fd == Some(fd) {
                return Err(MppError::Render(format!("add {}", fd)));
            }
            self.adds.push(fd);
            Ok(())
        }

        fn rm_dmabuf(&mut self, fd: i32) -> Result<()> {
            self.removes.push(fd);
            if self.fail_rm == Some(fd) {
                return Err(MppError::Render(format!("rm {}", fd)));
            }
            Ok(())
        }
    }

    fn buf(fds: [i32; 3]) -> VideoBuf {
        let mut buf = VideoBuf::new(PixelFormat::Yuv420p, Size::new(16, 16));
        buf.fd = fds;
        buf
    }

    #[test]
    fn test_same_id_imports_once() {
        let mut table = DmaImportTable::new();
        let mut dev = Recorder::default();
        let b = buf([3, 4, 5]);
        for _ in 0..5 {
            table.ensure(7, &b, &mut dev).unwrap();
        }
        assert_eq!(dev.adds, vec![3, 4, 5]);
        assert!(dev.removes.is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_new_id_reimports() {
        let mut table = DmaImportTable::new();
        let mut dev = Recorder::default();
        let b = buf([3, 4, 5]);
        table.ensure(7, &b, &mut dev).unwrap();
        table.ensure(8, &b, &mut dev).unwrap();
        assert_eq!(dev.removes, vec![3, 4, 5]);
        assert_eq!(dev.adds, vec![3, 4, 5, 3, 4, 5]);
        assert_eq!(table.frame_id(&b), Some(8));
    }

    #[test]
    fn test_unused_planes_ignored() {
        let mut table = DmaImportTable::new();
        let mut dev = Recorder::default();
        let mut b = VideoBuf::new(PixelFormat::Nv12, Size::new(16, 16));
        b.fd = [9, 10, 42];
        table.ensure(1, &b, &mut dev).unwrap();
        assert_eq!(dev.adds, vec![9, 10]);
    }

    #[test]
    fn test_failed_add_rolls_back() {
        let mut table = DmaImportTable::new();
        let mut dev = Recorder {
            fail_fd: Some(5),
            ..Recorder::default()
        };
        assert!(table.ensure(1, &buf([3, 4, 5]), &mut dev).is_err());
        assert_eq!(dev.removes, vec![3, 4]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_rollback_survives_failed_remove() {
        let mut table = DmaImportTable::new();
        let mut dev = Recorder {
            fail_fd: Some(5),
            fail_rm: Some(3),
            ..Recorder::default()
        };
        let err = table.ensure(1, &buf([3, 4, 5]), &mut dev).unwrap_err();
        assert!(err.to_string().contains("add 5"));
        assert_eq!(dev.removes, vec![3, 4]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_clear_removes_all() {
        let mut table = DmaImportTable::new();
        let mut dev = Recorder::default();
        table.ensure(1, &buf([1, 2, 3]), &mut dev).unwrap();
        table.ensure(2, &buf([4, 5, 6]), &mut dev).unwrap();
        table.clear(&mut dev);
        let mut removed = dev.removes.clone();
        removed.sort();
        assert_eq!(removed, vec![1, 2, 3, 4, 5, 6]);
        assert!(table.is_empty());
    }
}
