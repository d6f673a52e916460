//! System V shared memory segments.
use std::mem;
use std::ptr::{self, NonNull};

use nix::errno::Errno;

use crate::Error;

/// `SHM_DEST` from `<linux/shm.h>`: the segment is marked for removal and
/// disappears with its last attachment.
const SHM_DEST: u32 = 0o1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentStat {
    pub size: usize,
    pub attached: u64,
    pub marked_for_removal: bool,
}

/// An attachment of a SysV segment. Detached on drop; a segment created by
/// this process is also marked for removal on drop unless already marked.
#[derive(Debug)]
pub struct ShmSegment {
    id: i32,
    addr: NonNull<u8>,
    len: usize,
    owner: bool,
    removed: bool,
}

// SAFETY: the attachment is plain memory owned by this value; access is
// serialized by the command handshake.
unsafe impl Send for ShmSegment {}

impl ShmSegment {
    /// Allocates a private segment of `len` bytes and attaches it.
    pub fn create(len: usize) -> Result<Self, Error> {
        let id = unsafe { libc::shmget(libc::IPC_PRIVATE, len, libc::IPC_CREAT | 0o666) };
        if id < 0 {
            return Err(Errno::last().into());
        }
        match Self::attach_id(id, len, true) {
            Ok(seg) => Ok(seg),
            Err(e) => {
                unsafe { libc::shmctl(id, libc::IPC_RMID, ptr::null_mut()) };
                Err(e)
            }
        }
    }

    /// Attaches an existing segment created by another process.
    pub fn attach(id: i32) -> Result<Self, Error> {
        let stat = Self::stat(id)?.ok_or(Error::Sys(Errno::EINVAL))?;
        Self::attach_id(id, stat.size, false)
    }

    fn attach_id(id: i32, len: usize, owner: bool) -> Result<Self, Error> {
        let addr = unsafe { libc::shmat(id, ptr::null(), 0) };
        if addr as isize == -1 {
            return Err(Errno::last().into());
        }
        let addr = NonNull::new(addr.cast::<u8>()).ok_or(Error::Sys(Errno::EFAULT))?;
        Ok(ShmSegment {
            id,
            addr,
            len,
            owner,
            removed: false,
        })
    }

    /// Status of segment `id`, or `None` once it no longer exists.
    pub fn stat(id: i32) -> Result<Option<SegmentStat>, Error> {
        let mut ds: libc::shmid_ds = unsafe { mem::zeroed() };
        if unsafe { libc::shmctl(id, libc::IPC_STAT, &mut ds) } < 0 {
            return match Errno::last() {
                Errno::EINVAL | Errno::EIDRM => Ok(None),
                e => Err(e.into()),
            };
        }
        Ok(Some(SegmentStat {
            size: ds.shm_segsz as usize,
            attached: ds.shm_nattch as u64,
            marked_for_removal: ds.shm_perm.mode as u32 & SHM_DEST != 0,
        }))
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Marks the segment for removal. Idempotent.
    pub fn mark_removed(&mut self) -> Result<(), Error> {
        if self.removed {
            return Ok(());
        }
        if unsafe { libc::shmctl(self.id, libc::IPC_RMID, ptr::null_mut()) } < 0 {
            return Err(Errno::last().into());
        }
        self.removed = true;
        Ok(())
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        if self.owner {
            let _ = self.mark_removed();
        }
        unsafe { libc::shmdt(self.addr.as_ptr().cast()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_attach_remove() {
        let seg = ShmSegment::create(8192).unwrap();
        let id = seg.id();
        unsafe { seg.as_ptr().write(42) };

        let peer = ShmSegment::attach(id).unwrap();
        assert_eq!(peer.len(), 8192);
        assert_eq!(unsafe { peer.as_ptr().read() }, 42);

        let stat = ShmSegment::stat(id).unwrap().unwrap();
        assert_eq!(stat.attached, 2);
        assert!(!stat.marked_for_removal);

        drop(seg);
        let stat = ShmSegment::stat(id).unwrap().unwrap();
        assert!(stat.marked_for_removal);
        assert_eq!(stat.attached, 1);

        drop(peer);
        assert_eq!(ShmSegment::stat(id).unwrap(), None);
    }

    #[test]
    fn mark_removed_once() {
        let mut seg = ShmSegment::create(4096).unwrap();
        seg.mark_removed().unwrap();
        seg.mark_removed().unwrap();
        assert!(seg.is_removed());
        let id = seg.id();
        drop(seg);
        assert_eq!(ShmSegment::stat(id).unwrap(), None);
    }

    #[test]
    fn attach_unknown_segment() {
        assert!(ShmSegment::attach(-1).is_err());
    }
}
