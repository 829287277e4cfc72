//! Per-attempt transaction handed to an update handler.

use crate::bus::{BusMask, low_bits};
use crate::id::{NetId, NodeId, RoundId, TerminalId, TransactionId};
use crate::terminal::{Terminal, TerminalBank};
use std::collections::{BTreeMap, HashMap};

/// Errors a handler can hit while reading or proposing terminal values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    #[error("transaction {tx:?}: component has no terminal named {name}")]
    UnknownTerminal { tx: TransactionId, name: String },
    #[error("transaction {tx:?}: mask {mask} exceeds {name} (width {width})")]
    Range {
        tx: TransactionId,
        name: String,
        mask: BusMask,
        width: u32,
    },
}

/// Read-only view of terminal state during a round: committed storage
/// overlaid with the commits made earlier in the same round.
#[derive(Debug, Clone, Copy)]
pub struct RoundView<'a> {
    pub(crate) bank: &'a TerminalBank,
    pub(crate) overlay: &'a HashMap<NetId, bool>,
}

impl<'a> RoundView<'a> {
    pub(crate) fn new(bank: &'a TerminalBank, overlay: &'a HashMap<NetId, bool>) -> Self {
        Self { bank, overlay }
    }

    pub fn net(&self, cell: NetId) -> bool {
        let root = self.bank.nets().find(cell);
        match self.overlay.get(&root) {
            Some(&v) => v,
            None => self.bank.nets().get(root),
        }
    }
}

/// One handler's proposal for one attempt.
///
/// Reads see the committed baseline, every change committed earlier in the
/// round, and this transaction's own proposals. Writes are limited to the
/// owning component's terminals and only take effect if the handler
/// returns `Commit`.
#[derive(Debug)]
pub struct Transaction<'a> {
    id: TransactionId,
    round: RoundId,
    owner: NodeId,
    view: RoundView<'a>,
    /// Proposed value per root net.
    proposed: BTreeMap<NetId, bool>,
    /// Proposed changes as written, per terminal.
    changes: Vec<(TerminalId, BusMask, u64)>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(id: TransactionId, round: RoundId, owner: NodeId, view: RoundView<'a>) -> Self {
        Self {
            id,
            round,
            owner,
            view,
            proposed: BTreeMap::new(),
            changes: Vec::new(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn round(&self) -> RoundId {
        self.round
    }

    pub fn owner(&self) -> NodeId {
        self.owner
    }

    /// Resolve one of the owner's terminals by name.
    pub fn terminal(&self, name: &str) -> Result<TerminalId, TransactionError> {
        self.view
            .bank
            .lookup(self.owner, name)
            .ok_or_else(|| TransactionError::UnknownTerminal {
                tx: self.id,
                name: name.to_string(),
            })
    }

    fn resolve(&self, name: &str, mask: Option<BusMask>) -> Result<(&'a Terminal, BusMask), TransactionError> {
        let id = self.terminal(name)?;
        let bank: &'a TerminalBank = self.view.bank;
        let t = bank
            .get(id)
            .ok_or_else(|| TransactionError::UnknownTerminal {
                tx: self.id,
                name: name.to_string(),
            })?;
        let mask = mask.unwrap_or(t.full_mask());
        if !mask.fits(t.width) {
            return Err(TransactionError::Range {
                tx: self.id,
                name: name.to_string(),
                mask,
                width: t.width,
            });
        }
        Ok((t, mask))
    }

    fn bit(&self, cell: NetId) -> bool {
        let root = self.view.bank.nets().find(cell);
        match self.proposed.get(&root) {
            Some(&v) => v,
            None => self.view.net(root),
        }
    }

    pub fn read(&self, name: &str) -> Result<u64, TransactionError> {
        self.read_masked(name, None)
    }

    /// Read a range, right-aligned. `None` reads the whole terminal.
    pub fn read_masked(&self, name: &str, mask: Option<BusMask>) -> Result<u64, TransactionError> {
        let (t, mask) = self.resolve(name, mask)?;
        Ok(t.masked_cells(mask)
            .iter()
            .enumerate()
            .fold(0u64, |acc, (i, &c)| if self.bit(c) { acc | (1 << i) } else { acc }))
    }

    pub fn read_bit(&self, name: &str) -> Result<bool, TransactionError> {
        Ok(self.read_masked(name, Some(BusMask::bit(0)))? == 1)
    }

    pub fn write(&mut self, name: &str, value: u64) -> Result<(), TransactionError> {
        self.write_masked(name, None, value)
    }

    pub fn set(&mut self, name: &str, value: bool) -> Result<(), TransactionError> {
        self.write_masked(name, Some(BusMask::bit(0)), value as u64)
    }

    /// Propose a value for a range. Bits on a latched net can only be set,
    /// whether the write goes through the latched signal itself, a bus it
    /// sits on or a bridged peer. Clearing happens through its reset signal.
    pub fn write_masked(&mut self, name: &str, mask: Option<BusMask>, value: u64) -> Result<(), TransactionError> {
        let (t, mask) = self.resolve(name, mask)?;
        let id = self.terminal(name)?;
        let value = value & low_bits(mask.count);
        for (i, &cell) in t.masked_cells(mask).iter().enumerate() {
            let mut bit = (value >> i) & 1 == 1;
            if self.view.bank.is_latched_net(cell) {
                bit |= self.bit(cell);
            }
            let root = self.view.bank.nets().find(cell);
            self.proposed.insert(root, bit);
        }
        self.changes.push((id, mask, value));
        Ok(())
    }

    /// Changes proposed so far, in write order.
    pub fn proposed_changes(&self) -> &[(TerminalId, BusMask, u64)] {
        &self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub(crate) fn into_net_writes(self) -> BTreeMap<NetId, bool> {
        self.proposed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Access, ComponentMeta, SignalDecl};
    use crate::terminal::TerminalLayout;
    use slotmap::SlotMap;

    fn bank_with(meta: ComponentMeta) -> (TerminalBank, NodeId) {
        let mut nodes = SlotMap::<NodeId, ()>::with_key();
        let node = nodes.insert(());
        let mut bank = TerminalBank::new();
        bank.allocate(node, &TerminalLayout::from_meta(&meta).unwrap());
        (bank, node)
    }

    #[test]
    fn read_your_own_writes() {
        let (bank, node) = bank_with(ComponentMeta::new().terminal("q", 4, Access::External));
        let overlay = HashMap::new();
        let mut tx = Transaction::new(TransactionId(1), RoundId(0), node, RoundView::new(&bank, &overlay));
        assert_eq!(tx.read("q").unwrap(), 0);
        tx.write("q", 0b1010).unwrap();
        assert_eq!(tx.read("q").unwrap(), 0b1010);
        assert_eq!(tx.read_masked("q", Some(BusMask::new(1, 2))).unwrap(), 0b01);
        // Storage untouched until commit.
        assert_eq!(bank.read(bank.lookup(node, "q").unwrap()), Some(0));
        assert_eq!(tx.proposed_changes().len(), 1);
    }

    #[test]
    fn overlay_is_visible() {
        let (bank, node) = bank_with(ComponentMeta::new().terminal("q", 1, Access::External));
        let q = bank.lookup(node, "q").unwrap();
        let root = bank.root_nets(q)[0];
        let overlay: HashMap<NetId, bool> = [(root, true)].into_iter().collect();
        let tx = Transaction::new(TransactionId(1), RoundId(0), node, RoundView::new(&bank, &overlay));
        assert!(tx.read_bit("q").unwrap());
    }

    #[test]
    fn unknown_terminal_and_range_errors() {
        let (bank, node) = bank_with(ComponentMeta::new().terminal("q", 4, Access::External));
        let overlay = HashMap::new();
        let mut tx = Transaction::new(TransactionId(7), RoundId(0), node, RoundView::new(&bank, &overlay));
        assert!(matches!(
            tx.read("nope"),
            Err(TransactionError::UnknownTerminal { .. })
        ));
        assert!(matches!(
            tx.write_masked("q", Some(BusMask::new(3, 2)), 1),
            Err(TransactionError::Range { .. })
        ));
        assert!(tx.is_empty());
    }

    #[test]
    fn latched_signal_cannot_be_cleared_by_write() {
        let meta = ComponentMeta::new()
            .signal(SignalDecl::standalone("irq", Access::External).latched("clr"))
            .signal(SignalDecl::standalone("clr", Access::External));
        let (bank, node) = bank_with(meta);
        let irq = bank.lookup(node, "irq").unwrap();
        let root = bank.root_nets(irq)[0];
        let overlay: HashMap<NetId, bool> = [(root, true)].into_iter().collect();
        let mut tx = Transaction::new(TransactionId(1), RoundId(0), node, RoundView::new(&bank, &overlay));
        tx.set("irq", false).unwrap();
        assert!(tx.read_bit("irq").unwrap());
    }

    #[test]
    fn bus_write_cannot_clear_latched_bit() {
        let meta = ComponentMeta::new()
            .terminal("data", 4, Access::External)
            .signal(SignalDecl::on_bus("irq", "data", 0, Access::External).latched("clr"))
            .signal(SignalDecl::standalone("clr", Access::External));
        let (bank, node) = bank_with(meta);
        let irq = bank.lookup(node, "irq").unwrap();
        let root = bank.root_nets(irq)[0];
        let overlay: HashMap<NetId, bool> = [(root, true)].into_iter().collect();
        let mut tx = Transaction::new(TransactionId(1), RoundId(0), node, RoundView::new(&bank, &overlay));
        tx.write("data", 0b0110).unwrap();
        assert_eq!(tx.read("data").unwrap(), 0b0111);
        assert!(tx.read_bit("irq").unwrap());
    }
}
