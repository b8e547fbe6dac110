use serde::{Deserialize, Serialize};

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw identifier.
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            /// Returns the raw identifier.
            pub const fn get(&self) -> u64 {
                self.0
            }

            /// Zero is never a valid identifier on the wire.
            pub const fn is_zero(&self) -> bool {
                self.0 == 0
            }

            /// Postgres has no unsigned 64-bit column; ids are stored as BIGINT.
            pub const fn as_i64(&self) -> i64 {
                self.0 as i64
            }

            /// Inverse of [`Self::as_i64`].
            pub const fn from_i64(id: i64) -> Self {
                Self(id as u64)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

numeric_id! {
    /// Identifier of a user account. Bosses and companions are both users.
    UserId
}

numeric_id! {
    /// Database identifier of an order. The external identifier is the order number.
    OrderId
}
