use serde::{Deserialize, Serialize};

use shipyard_core::ItemId;

/// Where every unit of an item currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAudit {
    pub item_id: ItemId,
    pub remaining: i64,
    /// Sum of cart reservations across all users.
    pub reserved: i64,
    /// Sum of ordered quantities, historically.
    pub ordered: i64,
}

impl StockAudit {
    pub fn accounted(&self) -> i64 {
        self.remaining + self.reserved + self.ordered
    }

    /// True when no unit was created or lost relative to the listed quantity.
    pub fn is_conserved(&self, listed: i64) -> bool {
        self.remaining >= 0 && self.accounted() == listed
    }
}
