//! Fixed-capacity circular byte queues.
//!
//! A [`FifoManager`] owns `Q` queues of `CAP` bytes each. Queues are handed
//! out once through [`FifoManager::create`] and addressed by their
//! [`FifoHandle`] afterwards.

/// Handle of one queue inside a [`FifoManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FifoHandle(u8);

impl FifoHandle {
    /// Index of the queue.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Control {
    in_use: bool,
    read: usize,
    write: usize,
    entries: usize,
}

/// Manager of `Q` independent byte queues of capacity `CAP`.
#[derive(Debug, Clone)]
pub struct FifoManager<const Q: usize, const CAP: usize> {
    controls: [Control; Q],
    storage: [[u8; CAP]; Q],
}

impl<const Q: usize, const CAP: usize> FifoManager<Q, CAP> {
    /// Manager with all queues free.
    pub fn new() -> Self {
        Self {
            controls: [Control::default(); Q],
            storage: [[0u8; CAP]; Q],
        }
    }

    /// Capacity of every queue.
    pub const fn capacity(&self) -> usize {
        CAP
    }

    /// Claim a free queue. Returns `None` when all are in use.
    pub fn create(&mut self) -> Option<FifoHandle> {
        let index = self.controls.iter().position(|c| !c.in_use)?;
        let handle = FifoHandle(u8::try_from(index).ok()?);
        self.controls[index] = Control {
            in_use: true,
            ..Control::default()
        };
        Some(handle)
    }

    /// Append `byte`. Returns `false` without touching the queue when it is
    /// full or the handle is unknown.
    pub fn write(&mut self, handle: FifoHandle, byte: u8) -> bool {
        let Some(ctrl) = self.control_mut(handle) else {
            return false;
        };
        if ctrl.entries == CAP {
            return false;
        }
        let pos = ctrl.write;
        ctrl.write = (ctrl.write + 1) % CAP;
        ctrl.entries += 1;
        self.storage[handle.index()][pos] = byte;
        true
    }

    /// Remove and return the oldest byte.
    pub fn read(&mut self, handle: FifoHandle) -> Option<u8> {
        let ctrl = self.control_mut(handle)?;
        if ctrl.entries == 0 {
            return None;
        }
        let pos = ctrl.read;
        ctrl.read = (ctrl.read + 1) % CAP;
        ctrl.entries -= 1;
        Some(self.storage[handle.index()][pos])
    }

    /// Number of bytes queued.
    pub fn scan(&self, handle: FifoHandle) -> usize {
        self.controls
            .get(handle.index())
            .filter(|c| c.in_use)
            .map_or(0, |c| c.entries)
    }

    /// Free space left.
    pub fn room(&self, handle: FifoHandle) -> usize {
        if self.control(handle).is_none() {
            return 0;
        }
        CAP - self.scan(handle)
    }

    /// Drop all queued bytes.
    pub fn clear(&mut self, handle: FifoHandle) {
        if let Some(ctrl) = self.control_mut(handle) {
            *ctrl = Control {
                in_use: true,
                ..Control::default()
            };
        }
    }

    fn control(&self, handle: FifoHandle) -> Option<&Control> {
        self.controls.get(handle.index()).filter(|c| c.in_use)
    }

    fn control_mut(&mut self, handle: FifoHandle) -> Option<&mut Control> {
        self.controls
            .get_mut(handle.index())
            .filter(|c| c.in_use && CAP > 0)
    }
}

impl<const Q: usize, const CAP: usize> Default for FifoManager<Q, CAP> {
    fn default() -> Self {
        Self::new()
    }
}
