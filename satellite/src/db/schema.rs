//! Foreign key metadata.
//!
//! Supplied by the migration layer; the engine uses it to order
//! shape deletes and to repair FK-violating incoming deletes.

use fnv::FnvHashMap;

use super::QualifiedTablename;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub child: QualifiedTablename,
    pub child_column: String,
    pub parent: QualifiedTablename,
    pub parent_column: String,
}

#[derive(Debug, Clone, Default)]
pub struct FkGraph {
    fks: Vec<ForeignKey>,
}

impl FkGraph {
    pub fn new(fks: Vec<ForeignKey>) -> Self {
        Self { fks }
    }

    pub fn is_empty(&self) -> bool {
        self.fks.is_empty()
    }

    /// FKs pointing at the given parent table.
    pub fn referencing(&self, parent: &QualifiedTablename) -> Vec<&ForeignKey> {
        self.fks.iter().filter(|fk| &fk.parent == parent).collect()
    }

    /// Order tables children-first so deletes never orphan a child.
    /// Tables without FK relationships keep their input order.
    pub fn delete_order(&self, tables: &[QualifiedTablename]) -> Vec<QualifiedTablename> {
        // Kahn's algorithm over the edge "child must go before parent".
        let mut dependants: FnvHashMap<&QualifiedTablename, usize> =
            tables.iter().map(|t| (t, 0)).collect();
        for fk in &self.fks {
            if dependants.contains_key(&fk.child) && fk.parent != fk.child {
                if let Some(count) = dependants.get_mut(&fk.parent) {
                    *count += 1;
                }
            }
        }

        let mut ordered: Vec<QualifiedTablename> = vec![];
        let mut remaining: Vec<&QualifiedTablename> = tables.iter().collect();

        while !remaining.is_empty() {
            let position = remaining
                .iter()
                .position(|t| dependants.get(t).copied().unwrap_or(0) == 0)
                // Cycle: fall back to input order rather than loop.
                .unwrap_or(0);
            let table = remaining.remove(position);
            for fk in &self.fks {
                if &fk.child == table && fk.parent != fk.child {
                    if let Some(count) = dependants.get_mut(&fk.parent) {
                        *count = count.saturating_sub(1);
                    }
                }
            }
            ordered.push(table.clone());
        }

        ordered
    }
}
