//! Row to container assignment
//!
//! Rows are bucketed by their declared type and containers are processed in
//! a fixed priority order. Each container type takes from the first
//! non-empty bucket in its allow-list, and buckets wrap around so scarce rows
//! are reused instead of leaving containers empty. A final pass hands any
//! remaining row to still-empty specific containers. Generic containers are
//! never part of that pass.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::row::SnippetType::*;
use crate::row::{fields, Row, SnippetType};

/// A destination slot discovered by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub name: String,
}

impl Container {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    pub fn snippet_type(&self) -> Option<SnippetType> {
        SnippetType::from_container_name(&self.name)
    }
}

/// Which row types a container type accepts, in preference order
#[derive(Debug)]
pub struct ContainerPolicy {
    pub container: SnippetType,
    pub accepts: &'static [SnippetType],
    /// Generic containers never take rows outside their allow-list
    pub generic: bool,
}

/// Policies in processing priority order
pub const POLICIES: &[ContainerPolicy] = &[
    ContainerPolicy {
        container: EOfferItem,
        accepts: &[EOfferItem, EShopItem],
        generic: false,
    },
    ContainerPolicy {
        container: EShopItem,
        accepts: &[EShopItem, EOfferItem],
        generic: false,
    },
    ContainerPolicy {
        container: EProductSnippet2,
        accepts: &[EProductSnippet2, EProductSnippet2Adv, ProductTileItem],
        generic: false,
    },
    ContainerPolicy {
        container: EProductSnippet,
        accepts: &[EProductSnippet, EProductSnippet2],
        generic: false,
    },
    ContainerPolicy {
        container: ProductTileItem,
        accepts: &[ProductTileItem, EProductSnippet2],
        generic: false,
    },
    ContainerPolicy {
        container: OrganicWithOfferInfo,
        accepts: &[OrganicWithOfferInfo, Organic],
        generic: false,
    },
    ContainerPolicy {
        container: ESnippet,
        accepts: &[ESnippet, Organic, OrganicWithOfferInfo],
        generic: true,
    },
    ContainerPolicy {
        container: Snippet,
        accepts: &[Snippet, ESnippet, Organic],
        generic: true,
    },
];

pub fn policy_for(container: SnippetType) -> Option<&'static ContainerPolicy> {
    POLICIES.iter().find(|p| p.container == container)
}

/// What a container received
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Slot {
    /// A row from the container's allow-list
    Matched { row_index: usize },
    /// A row handed out by the final pass
    Fallback { row_index: usize },
    /// Not data: disables the call-to-action of an empty offer container
    Stub { row: Row },
}

impl Slot {
    pub fn row_index(&self) -> Option<usize> {
        match self {
            Slot::Matched { row_index } | Slot::Fallback { row_index } => Some(*row_index),
            Slot::Stub { .. } => None,
        }
    }

    pub fn is_stub(&self) -> bool {
        matches!(self, Slot::Stub { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub slots: BTreeMap<String, Slot>,
    /// Containers left without a row or stub, in discovery order
    pub unassigned: Vec<String>,
    /// Containers that received a real row
    pub assigned: usize,
}

impl Assignment {
    pub fn slot(&self, container_id: &str) -> Option<&Slot> {
        self.slots.get(container_id)
    }

    /// The data row of a container, `None` for stubs and empty containers
    pub fn row_for<'r>(&self, container_id: &str, rows: &'r [Row]) -> Option<&'r Row> {
        self.slot(container_id)?
            .row_index()
            .and_then(|index| rows.get(index))
    }
}

/// Placeholder row for offer containers that got no data
pub fn stub_row(container: SnippetType) -> Option<Row> {
    let view = match container {
        EShopItem => "secondary",
        EOfferItem => "white",
        _ => return None,
    };
    let mut row = Row::new(container.as_str());
    row.set(fields::BUTTON, "true");
    row.set(fields::BUTTON_VIEW, view);
    row.set(fields::BUTTON_TYPE, "shop");
    Some(row)
}

/// Cyclic queue of row indices of one type
#[derive(Debug, Default)]
struct Bucket {
    rows: Vec<usize>,
    cursor: usize,
}

impl Bucket {
    fn take(&mut self) -> Option<usize> {
        if self.rows.is_empty() {
            return None;
        }
        let index = self.rows[self.cursor % self.rows.len()];
        self.cursor += 1;
        Some(index)
    }
}

pub fn assign(rows: &[Row], containers: &[Container]) -> Assignment {
    let mut buckets: HashMap<SnippetType, Bucket> = HashMap::new();
    for (index, row) in rows.iter().enumerate() {
        if let Some(kind) = row.snippet_type() {
            buckets.entry(kind).or_default().rows.push(index);
        }
    }

    let kinds: Vec<Option<SnippetType>> = containers.iter().map(Container::snippet_type).collect();
    let mut slots: Vec<Option<Slot>> = vec![None; containers.len()];
    let mut used = vec![false; rows.len()];

    for policy in POLICIES {
        for (ci, kind) in kinds.iter().enumerate() {
            if *kind != Some(policy.container) {
                continue;
            }
            let taken = policy
                .accepts
                .iter()
                .find_map(|accepted| buckets.get_mut(accepted).and_then(Bucket::take));
            if let Some(row_index) = taken {
                used[row_index] = true;
                slots[ci] = Some(Slot::Matched { row_index });
            }
        }
    }

    let mut fresh = 0;
    let mut pool_cursor = 0;
    for (ci, kind) in kinds.iter().enumerate() {
        if rows.is_empty() {
            break;
        }
        let eligible = kind
            .and_then(policy_for)
            .is_some_and(|policy| !policy.generic);
        if slots[ci].is_some() || !eligible {
            continue;
        }
        while fresh < rows.len() && used[fresh] {
            fresh += 1;
        }
        let row_index = if fresh < rows.len() {
            fresh
        } else {
            let index = pool_cursor % rows.len();
            pool_cursor += 1;
            index
        };
        used[row_index] = true;
        debug!(container = %containers[ci].id, row_index, "fallback assignment");
        slots[ci] = Some(Slot::Fallback { row_index });
    }

    let mut assignment = Assignment::default();
    for ((container, kind), slot) in containers.iter().zip(&kinds).zip(slots) {
        let slot = slot.or_else(|| kind.and_then(stub_row).map(|row| Slot::Stub { row }));
        match slot {
            Some(slot) => {
                if !slot.is_stub() {
                    assignment.assigned += 1;
                }
                assignment.slots.insert(container.id.clone(), slot);
            }
            None => {
                if kind.is_none() {
                    debug!(container = %container.id, name = %container.name, "unknown container type");
                }
                assignment.unassigned.push(container.id.clone());
            }
        }
    }

    info!(
        rows = rows.len(),
        containers = containers.len(),
        assigned = assignment.assigned,
        unassigned = assignment.unassigned.len(),
        "rows assigned"
    );
    assignment
}
