//! Macros for reducing job-argument boilerplate.

/// Auto-implement [`ToArguments::to_arguments`] for job payload structs that
/// derive `Serialize`.
///
/// Use this inside a `ToArguments` impl block as a one-liner replacement for
/// manual `serde_json::to_value` boilerplate.
///
/// # Example
///
/// ```ignore
/// use ballast_core::{ToArguments, auto_arguments};
/// use serde::{Serialize, Deserialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct SendEmail {
///     user_id: Uuid,
///     template: String,
/// }
///
/// impl ToArguments for SendEmail {
///     auto_arguments!();  // One line instead of a whole method!
/// }
/// ```
#[macro_export]
macro_rules! auto_arguments {
    () => {
        fn to_arguments(&self) -> serde_json::Value {
            serde_json::to_value(self).expect("job arguments must serialize to JSON")
        }
    };
}

/// A job payload that knows how to become the `arguments` JSON blob an
/// enqueued [`crate::types::NewJob`] carries.
pub trait ToArguments {
    fn to_arguments(&self) -> serde_json::Value;
}

#[cfg(test)]
mod tests {
    use super::ToArguments;
    use serde::Serialize;
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize)]
    struct SendEmail {
        user_id: Uuid,
        template: String,
    }

    impl ToArguments for SendEmail {
        crate::auto_arguments!();
    }

    #[test]
    fn auto_arguments_round_trips_through_serde() {
        let payload = SendEmail {
            user_id: Uuid::nil(),
            template: "welcome".to_string(),
        };
        let value = payload.to_arguments();
        assert_eq!(value["template"], "welcome");
    }
}
