use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// The underlying uuid.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_type!(
    /// Identity of a registered worker agent.
    WorkerId
);

id_type!(
    /// Identity of one saga execution.
    RunId
);

id_type!(
    /// Identity of a submitted problem.
    ProblemId
);

id_type!(
    /// Identity of one sub-task of a problem.
    TaskId
);

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(WorkerId::new(), WorkerId::new());
        assert_ne!(TaskId::new(), TaskId::new());
    }

    #[test]
    fn test_serde_transparent() {
        let id = RunId::new();
        let json = serde_json::to_string(&id).unwrap();
        // Serializes as a bare uuid string, not a wrapper object.
        assert!(json.starts_with('"'));
        let back: RunId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
