use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shipyard_core::{DomainError, DomainResult, Entity, ItemId, UserId};

/// A listed item with finite stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub owner: UserId,
    /// Price in smallest currency unit (e.g., cents).
    pub price: i64,
    /// Units not reserved by any cart and not ordered.
    pub remaining_quantity: i64,
    pub description: String,
    pub image_url: String,
    pub created_at: DateTime<Utc>,
}

impl Item {
    pub fn has_available(&self, quantity: i64) -> bool {
        self.remaining_quantity >= quantity
    }

    pub fn is_owned_by(&self, user_id: UserId) -> bool {
        self.owner == user_id
    }

    /// Apply the non-stock fields of a patch. Unset fields are left alone.
    pub fn apply_patch(&mut self, patch: &ItemPatch) {
        if let Some(price) = patch.price {
            self.price = price;
        }
        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
        if let Some(image_url) = &patch.image_url {
            self.image_url = image_url.clone();
        }
    }
}

impl Entity for Item {
    type Id = ItemId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Input for listing a new item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewItem {
    pub price: i64,
    pub remaining_quantity: i64,
    pub description: String,
    pub image_url: String,
}

impl NewItem {
    pub fn validate(&self) -> DomainResult<()> {
        if self.remaining_quantity <= 0 {
            return Err(DomainError::validation("can't create an unavailable item"));
        }
        if self.price < 0 {
            return Err(DomainError::validation("price cannot be negative"));
        }
        Ok(())
    }

    pub fn into_item(self, id: ItemId, owner: UserId, created_at: DateTime<Utc>) -> Item {
        Item {
            id,
            owner,
            price: self.price,
            remaining_quantity: self.remaining_quantity,
            description: self.description,
            image_url: self.image_url,
            created_at,
        }
    }
}

/// Owner-side edit of an item's presentation and price.
///
/// Stock is deliberately absent: remaining quantity only moves through cart
/// reservations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemPatch {
    pub price: Option<i64>,
    pub description: Option<String>,
    pub image_url: Option<String>,
}

impl ItemPatch {
    pub fn validate(&self) -> DomainResult<()> {
        match self.price {
            Some(p) if p < 0 => Err(DomainError::validation("price cannot be negative")),
            _ => Ok(()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.price.is_none() && self.description.is_none() && self.image_url.is_none()
    }
}
