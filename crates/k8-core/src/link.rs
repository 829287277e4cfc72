//! Interconnects between terminals.
//!
//! - **Bridge** merges the nets of the masked bits on both sides, so they
//!   are one storage location from then on.
//! - **Mirror** is recorded and fired by the scheduler at the end of every
//!   round in which the source range changed.
//! - **Copy** snapshots the source range into the target once, at link time.

use crate::bus::BusMask;
use crate::id::{LinkId, NetId, TerminalId};
use crate::metadata::LinkType;
use crate::terminal::{TerminalBank, read_cells};
use slotmap::SlotMap;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Errors raised while establishing interconnects.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("terminal not found: {0:?}")]
    UnknownTerminal(TerminalId),
    #[error("link {link}: mask {mask} exceeds {terminal} (width {width})")]
    Range {
        link: String,
        terminal: String,
        mask: BusMask,
        width: u32,
    },
    #[error("link {link}: source selects {source_count} bits, target selects {target_count}")]
    WidthMismatch {
        link: String,
        source_count: u32,
        target_count: u32,
    },
    #[error("link {link} declared in {declared_in}: scope {scope:?} does not name a hosted component")]
    UnresolvedScope {
        link: String,
        declared_in: String,
        scope: String,
    },
    #[error("link {link} declared in {declared_in}: no terminal {terminal} in {scope}")]
    UnknownTerminalName {
        link: String,
        declared_in: String,
        scope: String,
        terminal: String,
    },
    #[error("link {link} declared in {declared_in}: terminal {terminal} is not visible {depth} level(s) up")]
    AccessDenied {
        link: String,
        declared_in: String,
        terminal: String,
        depth: usize,
    },
}

/// An established link between two masked terminal ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interconnect {
    pub name: String,
    pub source: TerminalId,
    pub source_mask: BusMask,
    pub target: TerminalId,
    pub target_mask: BusMask,
    pub link_type: LinkType,
}

/// A bit reachable through more than one Bridge link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeHazard {
    pub terminal: TerminalId,
    pub bit: u32,
    pub links: Vec<String>,
}

/// Owns every interconnect, in establishment order.
#[derive(Debug, Default)]
pub struct Linker {
    links: SlotMap<LinkId, Interconnect>,
    order: Vec<LinkId>,
}

impl Linker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check masks against their terminals without linking anything.
    pub fn validate(
        bank: &TerminalBank,
        name: &str,
        source: TerminalId,
        source_mask: BusMask,
        target: TerminalId,
        target_mask: BusMask,
    ) -> Result<(), LinkError> {
        if source_mask.count != target_mask.count {
            return Err(LinkError::WidthMismatch {
                link: name.to_string(),
                source_count: source_mask.count,
                target_count: target_mask.count,
            });
        }
        for (id, mask) in [(source, source_mask), (target, target_mask)] {
            let t = bank.get(id).ok_or(LinkError::UnknownTerminal(id))?;
            if !mask.fits(t.width) {
                return Err(LinkError::Range {
                    link: name.to_string(),
                    terminal: t.name.clone(),
                    mask,
                    width: t.width,
                });
            }
        }
        Ok(())
    }

    /// Establish a link. Returns its id and the root nets whose committed
    /// value changed as a result.
    #[allow(clippy::too_many_arguments)]
    pub fn link(
        &mut self,
        bank: &mut TerminalBank,
        name: &str,
        source: TerminalId,
        source_mask: BusMask,
        target: TerminalId,
        target_mask: BusMask,
        link_type: LinkType,
    ) -> Result<(LinkId, BTreeSet<NetId>), LinkError> {
        Self::validate(bank, name, source, source_mask, target, target_mask)?;

        let changed = match link_type {
            LinkType::Bridge => bridge(bank, source, source_mask, target, target_mask),
            LinkType::Copy => copy_range(bank, source, source_mask, target, target_mask),
            LinkType::Mirror => BTreeSet::new(),
        };

        let id = self.links.insert(Interconnect {
            name: name.to_string(),
            source,
            source_mask,
            target,
            target_mask,
            link_type,
        });
        self.order.push(id);
        tracing::debug!(link = name, ?link_type, %source_mask, %target_mask, "interconnect established");
        Ok((id, changed))
    }

    pub fn get(&self, id: LinkId) -> Option<&Interconnect> {
        self.links.get(id)
    }

    /// Links in establishment order.
    pub fn iter(&self) -> impl Iterator<Item = (LinkId, &Interconnect)> {
        self.order
            .iter()
            .filter_map(|&id| self.links.get(id).map(|l| (id, l)))
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn mirrors(&self) -> impl Iterator<Item = (LinkId, &Interconnect)> {
        self.iter().filter(|(_, l)| l.link_type == LinkType::Mirror)
    }

    /// Drop every link with an endpoint in `terminals`, then rebuild the
    /// bridge unions from the surviving links.
    pub fn remove_touching(&mut self, bank: &mut TerminalBank, terminals: &HashSet<TerminalId>) -> Vec<LinkId> {
        let removed: Vec<LinkId> = self
            .iter()
            .filter(|(_, l)| terminals.contains(&l.source) || terminals.contains(&l.target))
            .map(|(id, _)| id)
            .collect();
        if removed.is_empty() {
            return removed;
        }
        for id in &removed {
            self.links.remove(*id);
        }
        self.order.retain(|id| self.links.contains_key(*id));

        bank.reset_unions();
        let bridges: Vec<Interconnect> = self
            .iter()
            .filter(|(_, l)| l.link_type == LinkType::Bridge)
            .map(|(_, l)| l.clone())
            .collect();
        for l in bridges {
            bridge(bank, l.source, l.source_mask, l.target, l.target_mask);
        }
        removed
    }

    /// Fire every mirror whose source range touches a net in `changed`,
    /// each at most once, following chains in establishment order until no
    /// further mirror fires. Nets changed by a mirror are added to
    /// `changed`. Returns the number of mirrors fired.
    pub fn propagate_mirrors(&self, bank: &mut TerminalBank, changed: &mut BTreeSet<NetId>) -> usize {
        let mut fired: HashSet<LinkId> = HashSet::new();
        loop {
            let mut progressed = false;
            for (id, l) in self.mirrors() {
                if fired.contains(&id) {
                    continue;
                }
                let touches = bank
                    .get(l.source)
                    .map(|t| {
                        t.masked_cells(l.source_mask)
                            .iter()
                            .any(|&c| changed.contains(&bank.nets().find(c)))
                    })
                    .unwrap_or(false);
                if !touches {
                    continue;
                }
                fired.insert(id);
                progressed = true;
                let newly = copy_range(bank, l.source, l.source_mask, l.target, l.target_mask);
                changed.extend(newly);
            }
            if !progressed {
                break;
            }
        }
        fired.len()
    }

    /// Bits written through more than one Bridge link.
    pub fn bridge_hazards(&self) -> Vec<BridgeHazard> {
        let mut uses: BTreeMap<(TerminalId, u32), Vec<String>> = BTreeMap::new();
        for (_, l) in self.iter().filter(|(_, l)| l.link_type == LinkType::Bridge) {
            for (terminal, mask) in [(l.source, l.source_mask), (l.target, l.target_mask)] {
                for bit in mask.bits() {
                    uses.entry((terminal, bit)).or_default().push(l.name.clone());
                }
            }
        }
        uses.into_iter()
            .filter(|(_, links)| links.len() > 1)
            .map(|((terminal, bit), links)| BridgeHazard { terminal, bit, links })
            .collect()
    }
}

fn bridge(
    bank: &mut TerminalBank,
    source: TerminalId,
    source_mask: BusMask,
    target: TerminalId,
    target_mask: BusMask,
) -> BTreeSet<NetId> {
    let mut changed = BTreeSet::new();
    let (Some(s), Some(t)) = (bank.get(source), bank.get(target)) else {
        return changed;
    };
    let pairs: Vec<(NetId, NetId)> = s
        .masked_cells(source_mask)
        .iter()
        .copied()
        .zip(t.masked_cells(target_mask).iter().copied())
        .collect();
    for (src, tgt) in pairs {
        let differs = bank.nets().get(src) != bank.nets().get(tgt);
        let root = bank.union_nets(src, tgt);
        if differs {
            changed.insert(root);
        }
    }
    changed
}

fn copy_range(
    bank: &mut TerminalBank,
    source: TerminalId,
    source_mask: BusMask,
    target: TerminalId,
    target_mask: BusMask,
) -> BTreeSet<NetId> {
    let Some(s) = bank.get(source) else {
        return BTreeSet::new();
    };
    let value = read_cells(s.masked_cells(source_mask), |c| bank.nets().get(c));
    bank.write_masked(target, target_mask, value)
}
