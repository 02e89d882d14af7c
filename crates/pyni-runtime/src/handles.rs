//! Frame-scoped local handle table.
//!
//! Local handles live in one arena that grows and shrinks with the frame stack. Every slot
//! remembers the identifier of the frame that opened it and handles carry that identifier as
//! their generation, so a handle surviving its frame never matches the slot that later reuses
//! its index. The table is per session and unsynchronised.

use pyni_core::handle::next_generation;
use pyni_core::{Handle, HandleKind, ObjectRef, PyniError, ViolationKind};
use serde::{Deserialize, Serialize};

/// Identifier of an active call frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameId(u32);

impl FrameId {
    pub fn as_raw(self) -> u32 {
        self.0
    }

    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        (raw != 0).then_some(FrameId(raw))
    }
}

/// How a local scope came into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Call argument opened by the host; borrowed by the extension.
    Argument,
    /// Result of an API constructor or accessor.
    Opened,
    /// Produced by `Dup`.
    Duplicated,
    /// Produced by loading a heap handle.
    HeapLoad,
    /// Produced by legacy interop.
    Legacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Open,
    Closed,
    Transferred,
}

#[derive(Debug, Clone)]
struct LocalSlot {
    backing: ObjectRef,
    generation: u32,
    state: SlotState,
    origin: Origin,
}

#[derive(Debug, Clone, Copy)]
struct FrameMark {
    id: FrameId,
    start: usize,
}

/// Classification of a handle against the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Open in a live frame.
    Open(ObjectRef),
    /// Belongs to a live frame but its scope already ended.
    Closed(ObjectRef),
    /// Local handle whose frame has exited.
    Stale,
    /// Null, heap, or otherwise not a local handle.
    Invalid,
}

/// An ownership scope still open when its frame exited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakedScope {
    pub handle: Handle,
    pub backing: ObjectRef,
    pub origin: Origin,
}

/// What tearing down a frame produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameReport {
    pub frame: FrameId,
    /// One entry per reference still held by the frame; the caller gives them back.
    pub released: Vec<ObjectRef>,
    /// Open scopes the extension never closed. Arguments are not included.
    pub leaked: Vec<LeakedScope>,
}

#[derive(Debug, Default)]
pub struct HandleTable {
    slots: Vec<LocalSlot>,
    frames: Vec<FrameMark>,
    last_frame: u32,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter_frame(&mut self) -> FrameId {
        self.last_frame = next_generation(self.last_frame);
        let id = FrameId(self.last_frame);
        self.frames.push(FrameMark {
            id,
            start: self.slots.len(),
        });
        id
    }

    pub fn exit_frame(&mut self, frame: FrameId) -> Result<FrameReport, PyniError> {
        let top = self.frames.last().copied().ok_or_else(|| {
            PyniError::violation(
                ViolationKind::InvalidContext,
                format!("frame {} exited with no frame active", frame.0),
            )
        })?;
        if top.id != frame {
            return Err(PyniError::violation(
                ViolationKind::InvalidContext,
                format!(
                    "frame {} exited while frame {} is innermost",
                    frame.0, top.id.0
                ),
            ));
        }
        self.frames.pop();
        let mut report = FrameReport {
            frame,
            released: Vec::new(),
            leaked: Vec::new(),
        };
        for (offset, slot) in self.slots.drain(top.start..).enumerate() {
            if slot.state != SlotState::Open {
                continue;
            }
            report.released.push(slot.backing);
            if slot.origin != Origin::Argument {
                report.leaked.push(LeakedScope {
                    handle: Handle::pack(
                        HandleKind::Local,
                        slot.generation,
                        (top.start + offset) as u32,
                    ),
                    backing: slot.backing,
                    origin: slot.origin,
                });
            }
        }
        Ok(report)
    }

    pub fn current_frame(&self) -> Option<FrameId> {
        self.frames.last().map(|mark| mark.id)
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Number of open scopes across all active frames.
    pub fn open_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state == SlotState::Open)
            .count()
    }

    /// Opens a scope in the innermost frame. The table takes over the reference it is given.
    pub fn open(&mut self, backing: ObjectRef, origin: Origin) -> Result<Handle, PyniError> {
        let frame = self.frames.last().copied().ok_or_else(|| {
            PyniError::violation(
                ViolationKind::InvalidContext,
                "handle opened with no frame active",
            )
        })?;
        let index = u32::try_from(self.slots.len())
            .map_err(|_| PyniError::invalid_handle("local handle table exhausted"))?;
        self.slots.push(LocalSlot {
            backing,
            generation: frame.id.0,
            state: SlotState::Open,
            origin,
        });
        Ok(Handle::pack(HandleKind::Local, frame.id.0, index))
    }

    pub fn open_local(&mut self, backing: ObjectRef) -> Result<Handle, PyniError> {
        self.open(backing, Origin::Opened)
    }

    pub fn open_argument(&mut self, backing: ObjectRef) -> Result<Handle, PyniError> {
        self.open(backing, Origin::Argument)
    }

    pub fn lookup(&self, handle: Handle) -> Lookup {
        if handle.is_null() || handle.kind() != HandleKind::Local {
            return Lookup::Invalid;
        }
        match self.slots.get(handle.index() as usize) {
            Some(slot) if slot.generation == handle.generation() => match slot.state {
                SlotState::Open => Lookup::Open(slot.backing),
                SlotState::Closed | SlotState::Transferred => Lookup::Closed(slot.backing),
            },
            _ if self.is_live_generation(handle.generation()) => Lookup::Invalid,
            _ => Lookup::Stale,
        }
    }

    fn is_live_generation(&self, generation: u32) -> bool {
        self.frames.iter().any(|mark| mark.id.0 == generation)
    }

    /// Backing reference of an open handle.
    pub fn backing(&self, handle: Handle) -> Result<ObjectRef, PyniError> {
        match self.lookup(handle) {
            Lookup::Open(backing) => Ok(backing),
            other => Err(not_open(handle, other)),
        }
    }

    /// Opens a new scope over the same backing. The caller supplies the extra reference.
    pub fn duplicate(&mut self, handle: Handle) -> Result<Handle, PyniError> {
        let backing = self.backing(handle)?;
        self.open(backing, Origin::Duplicated)
    }

    /// Ends one scope and returns the reference it held.
    pub fn close(&mut self, handle: Handle) -> Result<ObjectRef, PyniError> {
        match self.lookup(handle) {
            Lookup::Open(backing) => {
                self.slots[handle.index() as usize].state = SlotState::Closed;
                Ok(backing)
            }
            Lookup::Closed(_) => Err(PyniError::violation(
                ViolationKind::DoubleClose,
                format!("{handle:?} closed twice"),
            )),
            other => Err(not_open(handle, other)),
        }
    }

    /// Ends a scope and hands its reference to the caller without releasing it.
    pub fn transfer(&mut self, handle: Handle) -> Result<ObjectRef, PyniError> {
        let backing = self.backing(handle)?;
        self.slots[handle.index() as usize].state = SlotState::Transferred;
        Ok(backing)
    }
}

fn not_open(handle: Handle, lookup: Lookup) -> PyniError {
    match lookup {
        Lookup::Stale => PyniError::violation(
            ViolationKind::StaleHandleUse,
            format!("{handle:?} used after its frame exited"),
        ),
        Lookup::Closed(_) => {
            PyniError::invalid_handle(format!("{handle:?} is no longer open"))
        }
        _ => PyniError::invalid_handle(format!("{handle:?} is not a local handle")),
    }
}
