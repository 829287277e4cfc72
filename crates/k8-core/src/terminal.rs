//! Terminal storage.
//!
//! Every terminal bit is backed by a storage cell. Cells are grouped into
//! nets with a union-find structure: a Bridge link merges the nets of the
//! bits it connects, so a write through either terminal is visible through
//! the other without copying. A signal selecting a bit of a bus shares that
//! bit's cell outright.

use crate::bus::{BusMask, MAX_WIDTH};
use crate::id::{NetId, NodeId, TerminalId};
use crate::metadata::{Access, ComponentMeta};
use slotmap::{SecondaryMap, SlotMap};
use std::collections::{BTreeSet, HashMap};

// ---------------------------------------------------------------------------
// Net store
// ---------------------------------------------------------------------------

/// Union-find over single-bit cells. The value of a net lives on its root.
/// Released cells go on a free list and are handed out again by `alloc`.
#[derive(Debug, Clone, Default)]
pub struct NetStore {
    parent: Vec<u32>,
    size: Vec<u32>,
    values: Vec<bool>,
    free: Vec<u32>,
}

impl NetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, value: bool) -> NetId {
        if let Some(id) = self.free.pop() {
            let i = id as usize;
            self.parent[i] = id;
            self.size[i] = 1;
            self.values[i] = value;
            return NetId(id);
        }
        let id = self.parent.len() as u32;
        self.parent.push(id);
        self.size.push(1);
        self.values.push(value);
        NetId(id)
    }

    /// Root net of `cell`.
    pub fn find(&self, cell: NetId) -> NetId {
        let mut current = cell.0;
        while let Some(&p) = self.parent.get(current as usize) {
            if p == current {
                break;
            }
            current = p;
        }
        NetId(current)
    }

    pub fn get(&self, cell: NetId) -> bool {
        let root = self.find(cell);
        self.values.get(root.0 as usize).copied().unwrap_or(false)
    }

    pub fn set(&mut self, cell: NetId, value: bool) {
        let root = self.find(cell);
        if let Some(v) = self.values.get_mut(root.0 as usize) {
            *v = value;
        }
    }

    /// Merge the nets of `keep` and `other`. The merged net takes the value
    /// of `keep`. Returns the new root.
    pub fn union(&mut self, keep: NetId, other: NetId) -> NetId {
        let a = self.find(keep);
        let b = self.find(other);
        if a == b {
            return a;
        }
        let value = self.values[a.0 as usize];
        let (root, child) = if self.size[a.0 as usize] >= self.size[b.0 as usize] {
            (a, b)
        } else {
            (b, a)
        };
        self.parent[child.0 as usize] = root.0;
        self.size[root.0 as usize] += self.size[child.0 as usize];
        self.values[root.0 as usize] = value;
        root
    }

    /// Split every net back into single cells, each keeping the value it
    /// currently reads.
    pub fn reset_unions(&mut self) {
        let resolved: Vec<bool> = (0..self.parent.len() as u32)
            .map(|c| self.get(NetId(c)))
            .collect();
        for (c, p) in self.parent.iter_mut().enumerate() {
            *p = c as u32;
        }
        self.size.iter_mut().for_each(|s| *s = 1);
        self.values = resolved;
    }

    /// Return a cell to the free list. Only single-cell nets can be
    /// released; a cell still merged with others is left alone.
    pub fn release(&mut self, cell: NetId) -> bool {
        let i = cell.0 as usize;
        if self.parent.get(i) != Some(&cell.0) || self.size.get(i) != Some(&1) {
            return false;
        }
        self.values[i] = false;
        self.free.push(cell.0);
        true
    }

    /// Cells currently in use.
    pub fn cell_count(&self) -> usize {
        self.parent.len() - self.free.len()
    }

    /// Cells ever allocated, live or free.
    pub fn capacity(&self) -> usize {
        self.parent.len()
    }
}

// ---------------------------------------------------------------------------
// Layout (validated declarations, not yet allocated)
// ---------------------------------------------------------------------------

/// Where a terminal's bits are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitSource {
    /// Fresh cells of its own.
    Own,
    /// One bit of an earlier layout entry.
    BusBit { bus: usize, bit: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutEntry {
    pub name: String,
    pub width: u32,
    pub access: Access,
    pub source: BitSource,
    pub is_signal: bool,
    /// Index of the reset signal for a latched signal.
    pub latched_reset: Option<usize>,
}

/// The validated terminal set of one component.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminalLayout {
    pub entries: Vec<LayoutEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("terminal {name} has width {width}, expected 1..={MAX_WIDTH}")]
    BadWidth { name: String, width: u32 },
    #[error("terminal name {0} declared twice")]
    DuplicateTerminal(String),
    #[error("signal {signal} selects unknown bus {bus}")]
    UnknownBus { signal: String, bus: String },
    #[error("signal {signal} selects bit {bit} of {bus} (width {width})")]
    SelectOutOfRange {
        signal: String,
        bus: String,
        bit: u32,
        width: u32,
    },
    #[error("latched signal {signal} names reset signal {reset} which is not a terminal of the same component")]
    MissingResetSignal { signal: String, reset: String },
    #[error("latched signal {0} cannot reset itself")]
    SelfReset(String),
}

impl TerminalLayout {
    /// Validate the terminals and signals a component declares.
    pub fn from_meta(meta: &ComponentMeta) -> Result<Self, LayoutError> {
        let mut entries: Vec<LayoutEntry> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();

        for decl in &meta.terminals {
            if decl.width == 0 || decl.width > MAX_WIDTH {
                return Err(LayoutError::BadWidth {
                    name: decl.name.clone(),
                    width: decl.width,
                });
            }
            if index.insert(decl.name.as_str(), entries.len()).is_some() {
                return Err(LayoutError::DuplicateTerminal(decl.name.clone()));
            }
            entries.push(LayoutEntry {
                name: decl.name.clone(),
                width: decl.width,
                access: decl.access,
                source: BitSource::Own,
                is_signal: false,
                latched_reset: None,
            });
        }

        for decl in &meta.signals {
            let source = match &decl.bus {
                None => BitSource::Own,
                Some(bus) => {
                    let &bus_idx = index.get(bus.as_str()).ok_or_else(|| LayoutError::UnknownBus {
                        signal: decl.name.clone(),
                        bus: bus.clone(),
                    })?;
                    let width = entries[bus_idx].width;
                    if decl.select_bit >= width {
                        return Err(LayoutError::SelectOutOfRange {
                            signal: decl.name.clone(),
                            bus: bus.clone(),
                            bit: decl.select_bit,
                            width,
                        });
                    }
                    BitSource::BusBit {
                        bus: bus_idx,
                        bit: decl.select_bit,
                    }
                }
            };
            if index.insert(decl.name.as_str(), entries.len()).is_some() {
                return Err(LayoutError::DuplicateTerminal(decl.name.clone()));
            }
            entries.push(LayoutEntry {
                name: decl.name.clone(),
                width: 1,
                access: decl.access,
                source,
                is_signal: true,
                latched_reset: None,
            });
        }

        // Reset signals may be declared after the latch that names them.
        for decl in &meta.signals {
            let Some(reset) = &decl.latched else { continue };
            if reset == &decl.name {
                return Err(LayoutError::SelfReset(decl.name.clone()));
            }
            let &reset_idx = index
                .get(reset.as_str())
                .ok_or_else(|| LayoutError::MissingResetSignal {
                    signal: decl.name.clone(),
                    reset: reset.clone(),
                })?;
            if let Some(&idx) = index.get(decl.name.as_str()) {
                entries[idx].latched_reset = Some(reset_idx);
            }
        }

        Ok(Self { entries })
    }
}

// ---------------------------------------------------------------------------
// Terminals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    Bus,
    Signal { latched_reset: Option<TerminalId> },
}

/// A named, width-typed access point on an attached component.
#[derive(Debug, Clone)]
pub struct Terminal {
    pub owner: NodeId,
    pub name: String,
    pub width: u32,
    pub access: Access,
    pub kind: TerminalKind,
    /// Storage cell of each bit, low to high.
    cells: Vec<NetId>,
}

impl Terminal {
    pub fn cells(&self) -> &[NetId] {
        &self.cells
    }

    pub fn full_mask(&self) -> BusMask {
        BusMask::full(self.width)
    }

    pub fn latched_reset(&self) -> Option<TerminalId> {
        match self.kind {
            TerminalKind::Signal { latched_reset } => latched_reset,
            TerminalKind::Bus => None,
        }
    }

    /// Cells selected by `mask`. Caller has checked `mask.fits(width)`.
    pub fn masked_cells(&self, mask: BusMask) -> &[NetId] {
        let start = (mask.offset as usize).min(self.cells.len());
        let end = (mask.end() as usize).min(self.cells.len());
        &self.cells[start..end]
    }
}

/// All terminals of all attached components plus their backing nets.
///
/// A latched signal protects its whole net: a bit on a latched net can only
/// be set by writes, whichever terminal they go through, and is cleared only
/// when the signal's reset reads high.
#[derive(Debug, Default)]
pub struct TerminalBank {
    terminals: SlotMap<TerminalId, Terminal>,
    by_owner: SecondaryMap<NodeId, Vec<TerminalId>>,
    by_name: HashMap<(NodeId, String), TerminalId>,
    nets: NetStore,
    /// Cells of latched signals.
    latched_cells: BTreeSet<NetId>,
    /// Current roots of the nets holding a latched cell.
    latched_roots: BTreeSet<NetId>,
}

impl TerminalBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the terminals of a freshly attached component.
    pub fn allocate(&mut self, owner: NodeId, layout: &TerminalLayout) -> Vec<TerminalId> {
        let mut ids: Vec<TerminalId> = Vec::with_capacity(layout.entries.len());
        for entry in &layout.entries {
            let cells = match entry.source {
                BitSource::Own => (0..entry.width).map(|_| self.nets.alloc(false)).collect(),
                BitSource::BusBit { bus, bit } => ids
                    .get(bus)
                    .and_then(|&bus_id| self.terminals.get(bus_id))
                    .and_then(|t| t.cells.get(bit as usize).copied())
                    .map(|cell| vec![cell])
                    .unwrap_or_else(|| vec![self.nets.alloc(false)]),
            };
            let id = self.terminals.insert(Terminal {
                owner,
                name: entry.name.clone(),
                width: entry.width,
                access: entry.access,
                kind: if entry.is_signal {
                    TerminalKind::Signal { latched_reset: None }
                } else {
                    TerminalKind::Bus
                },
                cells,
            });
            self.by_name.insert((owner, entry.name.clone()), id);
            ids.push(id);
        }
        for (entry, &id) in layout.entries.iter().zip(&ids) {
            if let Some(reset) = entry.latched_reset.and_then(|r| ids.get(r).copied()) {
                if let Some(t) = self.terminals.get_mut(id) {
                    t.kind = TerminalKind::Signal {
                        latched_reset: Some(reset),
                    };
                    self.latched_cells.extend(t.cells.iter().copied());
                }
            }
        }
        self.by_owner.insert(owner, ids.clone());
        self.refresh_latched_roots();
        ids
    }

    /// Drop every terminal of `owner` and release their cells.
    ///
    /// Links touching these terminals must already be gone, so every cell
    /// they own is a net of its own.
    pub fn remove_owner(&mut self, owner: NodeId) -> Vec<TerminalId> {
        let ids = self.by_owner.remove(owner).unwrap_or_default();
        let mut cells: BTreeSet<NetId> = BTreeSet::new();
        for &id in &ids {
            if let Some(t) = self.terminals.remove(id) {
                self.by_name.remove(&(owner, t.name));
                cells.extend(t.cells);
            }
        }
        let mut released = 0usize;
        for cell in cells {
            self.latched_cells.remove(&cell);
            if self.nets.release(cell) {
                released += 1;
            }
        }
        self.refresh_latched_roots();
        tracing::trace!(?owner, terminals = ids.len(), released, "terminals removed");
        ids
    }

    pub fn get(&self, id: TerminalId) -> Option<&Terminal> {
        self.terminals.get(id)
    }

    pub fn lookup(&self, owner: NodeId, name: &str) -> Option<TerminalId> {
        self.by_name.get(&(owner, name.to_string())).copied()
    }

    pub fn owned_by(&self, owner: NodeId) -> &[TerminalId] {
        self.by_owner
            .get(owner)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (TerminalId, &Terminal)> {
        self.terminals.iter()
    }

    pub fn len(&self) -> usize {
        self.terminals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terminals.is_empty()
    }

    pub fn nets(&self) -> &NetStore {
        &self.nets
    }

    /// Whether `cell` sits on a net holding a latched signal.
    pub fn is_latched_net(&self, cell: NetId) -> bool {
        self.latched_roots.contains(&self.nets.find(cell))
    }

    /// Roots of the nets holding a latched signal.
    pub fn latched_nets(&self) -> &BTreeSet<NetId> {
        &self.latched_roots
    }

    fn refresh_latched_roots(&mut self) {
        self.latched_roots = self.latched_cells.iter().map(|&c| self.nets.find(c)).collect();
    }

    /// Merge two nets, keeping the value of `keep`. Returns the new root.
    pub(crate) fn union_nets(&mut self, keep: NetId, other: NetId) -> NetId {
        let (a, b) = (self.nets.find(keep), self.nets.find(other));
        let root = self.nets.union(keep, other);
        if self.latched_roots.remove(&a) | self.latched_roots.remove(&b) {
            self.latched_roots.insert(root);
        }
        root
    }

    /// Split every net back into single cells.
    pub(crate) fn reset_unions(&mut self) {
        self.nets.reset_unions();
        self.refresh_latched_roots();
    }

    /// Store a net value as is, latched or not.
    pub(crate) fn set_net(&mut self, cell: NetId, value: bool) {
        self.nets.set(cell, value);
    }

    /// Committed value of a whole terminal.
    pub fn read(&self, id: TerminalId) -> Option<u64> {
        let t = self.terminals.get(id)?;
        Some(read_cells(&t.cells, |cell| self.nets.get(cell)))
    }

    /// Committed value of a masked range, right-aligned.
    pub fn read_masked(&self, id: TerminalId, mask: BusMask) -> Option<u64> {
        let t = self.terminals.get(id)?;
        if !mask.fits(t.width) {
            return None;
        }
        Some(read_cells(t.masked_cells(mask), |cell| self.nets.get(cell)))
    }

    /// Write a masked range directly into committed storage. Bits on a
    /// latched net can only be set. Returns the roots of nets whose value
    /// changed.
    pub fn write_masked(&mut self, id: TerminalId, mask: BusMask, value: u64) -> BTreeSet<NetId> {
        self.store(id, mask, value, true)
    }

    /// Clear the net of a latched signal whose reset fired.
    pub(crate) fn clear_latch(&mut self, id: TerminalId) -> BTreeSet<NetId> {
        self.store(id, BusMask::bit(0), 0, false)
    }

    fn store(&mut self, id: TerminalId, mask: BusMask, value: u64, latching: bool) -> BTreeSet<NetId> {
        let mut changed = BTreeSet::new();
        let Some(t) = self.terminals.get(id) else {
            return changed;
        };
        if !mask.fits(t.width) {
            return changed;
        }
        for (i, &cell) in t.masked_cells(mask).iter().enumerate() {
            let root = self.nets.find(cell);
            let current = self.nets.get(root);
            let mut bit = (value >> i) & 1 == 1;
            if latching && self.latched_roots.contains(&root) {
                bit |= current;
            }
            if current != bit {
                self.nets.set(root, bit);
                changed.insert(root);
            }
        }
        changed
    }

    /// Root nets touched by a terminal.
    pub fn root_nets(&self, id: TerminalId) -> Vec<NetId> {
        self.terminals
            .get(id)
            .map(|t| t.cells.iter().map(|&c| self.nets.find(c)).collect())
            .unwrap_or_default()
    }
}

/// Assemble a right-aligned word from per-cell reads.
pub(crate) fn read_cells(cells: &[NetId], mut get: impl FnMut(NetId) -> bool) -> u64 {
    cells
        .iter()
        .enumerate()
        .fold(0u64, |acc, (i, &cell)| if get(cell) { acc | (1 << i) } else { acc })
}
