use serde::{Deserialize, Serialize};

use shipyard_core::{AddressId, Entity, UserId};

/// Delivery address owned by a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub id: AddressId,
    pub user_id: UserId,
    pub line1: String,
    pub line2: String,
    pub line3: String,
    pub country: String,
    pub state: String,
    pub city: String,
    pub zip: String,
    pub phone: String,
    pub notes: String,
}

impl Entity for Address {
    type Id = AddressId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAddress {
    pub line1: String,
    pub line2: String,
    pub line3: String,
    pub country: String,
    pub state: String,
    pub city: String,
    pub zip: String,
    pub phone: String,
    pub notes: String,
}

impl NewAddress {
    pub fn into_address(self, id: AddressId, user_id: UserId) -> Address {
        Address {
            id,
            user_id,
            line1: self.line1,
            line2: self.line2,
            line3: self.line3,
            country: self.country,
            state: self.state,
            city: self.city,
            zip: self.zip,
            phone: self.phone,
            notes: self.notes,
        }
    }
}
