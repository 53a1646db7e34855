//! The DOS file-handle table: small integers mapped to host channels,
//! with 0, 1 and 2 preopened on the standard streams.

use std::collections::HashMap;
use std::fs::File;

/// Handles at or above this value are never handed out.
pub const MAX_HANDLES: u16 = 200;

/// The first handle available to `open`/`create`.
const FIRST_FREE: u16 = 3;

pub const STDIN_HANDLE: u16 = 0;
pub const STDOUT_HANDLE: u16 = 1;
pub const STDERR_HANDLE: u16 = 2;

/// What a DOS handle refers to on the host.
#[derive(Debug)]
pub enum Channel {
    Stdin,
    Stdout,
    Stderr,
    File(File),
}

/// The per-guest handle table.
#[derive(Debug)]
pub struct FileHandles {
    open: HashMap<u16, Channel>,
}

impl FileHandles {
    /// Creates a table with the three standard handles preallocated.
    pub fn new() -> Self {
        let mut open = HashMap::new();
        open.insert(STDIN_HANDLE, Channel::Stdin);
        open.insert(STDOUT_HANDLE, Channel::Stdout);
        open.insert(STDERR_HANDLE, Channel::Stderr);
        Self { open }
    }

    /// Stores a freshly opened file under the lowest free handle, or
    /// returns `None` when the table is full.
    pub fn insert(&mut self, file: File) -> Option<u16> {
        let handle = (FIRST_FREE..MAX_HANDLES).find(|h| !self.open.contains_key(h))?;
        self.open.insert(handle, Channel::File(file));
        Some(handle)
    }

    pub fn get(&self, handle: u16) -> Option<&Channel> {
        self.open.get(&handle)
    }

    pub fn get_mut(&mut self, handle: u16) -> Option<&mut Channel> {
        self.open.get_mut(&handle)
    }

    /// Removes a handle from the table, closing the file when the last
    /// reference drops.
    pub fn remove(&mut self, handle: u16) -> Option<Channel> {
        self.open.remove(&handle)
    }
}

impl Default for FileHandles {
    fn default() -> Self {
        Self::new()
    }
}
