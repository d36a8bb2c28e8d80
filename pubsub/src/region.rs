use std::{
    mem::size_of,
    ptr::{null_mut, NonNull},
};

use rustix::{
    fd::OwnedFd,
    fs::{fstat, ftruncate, Mode, Stat},
    io::Errno,
    mm::{mmap, munmap, MapFlags, ProtFlags},
    shm,
};

use crate::{block::ChannelBlock, ChannelError, Result};

const NAME_MAX: usize = 255;

/// Turns `name` into a portable POSIX shared memory name (a single leading '/').
pub(crate) fn normalize_name(name: &str) -> Result<String> {
    let invalid = |reason| ChannelError::InvalidName {
        name: name.to_string(),
        reason,
    };

    let name = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };

    if name.len() < 2 {
        return Err(invalid("name must not be empty"));
    }
    if name[1..].contains('/') {
        return Err(invalid("name must not contain '/' after the leading one"));
    }
    if name.len() > NAME_MAX {
        return Err(invalid("name must be at most 255 bytes"));
    }

    Ok(name)
}

/// Identity of a shared memory object, to tell a recreated region apart from the one we mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ObjectId {
    dev: u64,
    ino: u64,
}

impl From<&Stat> for ObjectId {
    fn from(stat: &Stat) -> Self {
        Self {
            dev: stat.st_dev as u64,
            ino: stat.st_ino as u64,
        }
    }
}

/// A [`ChannelBlock`] mapped from a named shared memory object. Unmapped on drop.
pub(crate) struct Region {
    ptr: NonNull<ChannelBlock>,
    name: String,
    id: ObjectId,
}

// SAFETY: the mapping is not tied to the thread that created it and ChannelBlock is Sync.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Opens the named object, creating it when absent, and sizes it for a [`ChannelBlock`].
    ///
    /// Returns the region and whether this call created the object.
    pub fn create_or_attach(name: &str) -> Result<(Self, bool)> {
        let (fd, created) = match shm::open(
            name,
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        ) {
            Ok(fd) => (fd, true),
            Err(e) if e == Errno::EXIST => (
                shm::open(name, shm::OFlags::RDWR, Mode::empty())
                    .map_err(|e| ChannelError::posix("shm_open", name, e))?,
                false,
            ),
            Err(e) => return Err(ChannelError::posix("shm_open", name, e)),
        };

        let stat = fstat(&fd).map_err(|e| ChannelError::posix("fstat", name, e))?;
        if stat.st_size as i64 != size_of::<ChannelBlock>() as i64 {
            // a fresh object has size zero, a mismatching one is from an incompatible layout;
            // either way the writer owns the layout
            if let Err(e) = ftruncate(&fd, size_of::<ChannelBlock>() as u64) {
                if created {
                    let _ = shm::unlink(name);
                }
                return Err(ChannelError::posix("ftruncate", name, e));
            }
        }

        match Self::map(fd, name, &stat) {
            Ok(region) => Ok((region, created)),
            Err(e) => {
                if created {
                    let _ = shm::unlink(name);
                }
                Err(e)
            }
        }
    }

    /// Opens an existing object. Never creates one.
    pub fn attach(name: &str) -> Result<Self> {
        let fd = shm::open(name, shm::OFlags::RDWR, Mode::empty()).map_err(|e| {
            if e == Errno::NOENT {
                ChannelError::Unavailable {
                    name: name.to_string(),
                }
            } else {
                ChannelError::posix("shm_open", name, e)
            }
        })?;

        let stat = fstat(&fd).map_err(|e| ChannelError::posix("fstat", name, e))?;
        if stat.st_size as i64 != size_of::<ChannelBlock>() as i64 {
            return Err(ChannelError::SizeMismatch {
                name: name.to_string(),
                expected: size_of::<ChannelBlock>(),
                actual: stat.st_size as i64,
            });
        }

        Self::map(fd, name, &stat)
    }

    fn map(fd: OwnedFd, name: &str, stat: &Stat) -> Result<Self> {
        // SAFETY: a new shared mapping of an object that is size_of::<ChannelBlock>() bytes long.
        // mmap returns page aligned addresses, which satisfies the alignment of ChannelBlock.
        // Every bit pattern of ChannelBlock is valid, so reading it before initialization is fine.
        let ptr = unsafe {
            mmap(
                null_mut(),
                size_of::<ChannelBlock>(),
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        }
        .map_err(|e| ChannelError::posix("mmap", name, e))?;

        // the mapping stays valid after the descriptor is closed
        drop(fd);

        let ptr = NonNull::new(ptr.cast::<ChannelBlock>()).ok_or_else(|| {
            ChannelError::posix("mmap", name, Errno::NOMEM)
        })?;

        Ok(Self {
            ptr,
            name: name.to_string(),
            id: stat.into(),
        })
    }

    pub fn block(&self) -> &ChannelBlock {
        // SAFETY: the memory stays mapped until self is dropped
        unsafe { self.ptr.as_ref() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if our name no longer refers to the object we have mapped, because it was removed
    /// or removed and created again.
    pub fn is_detached(&self) -> bool {
        match shm::open(self.name.as_str(), shm::OFlags::RDONLY, Mode::empty()) {
            Ok(fd) => match fstat(&fd) {
                Ok(stat) => ObjectId::from(&stat) != self.id,
                Err(_) => false,
            },
            Err(e) if e == Errno::NOENT => true,
            // permission problems etc. say nothing about the object being gone
            Err(_) => false,
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: ptr and size are the ones returned by / passed to mmap
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), size_of::<ChannelBlock>());
        }
    }
}

/// Removes the name of a shared memory object. Processes that have it mapped keep their mapping.
pub(crate) fn unlink(name: &str) -> Result<()> {
    match shm::unlink(name) {
        Ok(()) => Ok(()),
        Err(e) if e == Errno::NOENT => Err(ChannelError::Unavailable {
            name: name.to_string(),
        }),
        Err(e) => Err(ChannelError::posix("shm_unlink", name, e)),
    }
}
