//! Metric and log events emitted by the primitives.
//!
//! Each event is declared with [`registered_event!`](crate::registered_event), which
//! registers its metric handles once and exposes an `emit` method.

/// Declares an event struct holding pre-registered metric handles.
///
/// ```ignore
/// registered_event! {
///     RetryAttempt => {
///         attempts: Counter = counter!("retry_attempts_total"),
///     }
///
///     fn emit(&self, attempt: usize) {
///         self.attempts.increment(1);
///     }
/// }
/// ```
#[macro_export]
macro_rules! registered_event {
    (
        $event:ident => {
            $($field:ident: $type:ty = $init:expr,)*
        }

        fn emit(&$slf:ident, $data_name:ident: $data_type:ty)
            $emit_body:block
    ) => {
        #[derive(Clone)]
        pub(crate) struct $event {
            $(pub(crate) $field: $type,)*
        }

        impl $event {
            pub(crate) fn register() -> Self {
                Self {
                    $($field: $init,)*
                }
            }

            pub(crate) fn emit(&$slf, $data_name: $data_type) $emit_body
        }

        impl std::fmt::Debug for $event {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(stringify!($event))
            }
        }
    };
}

mod resilience;

pub(crate) use self::resilience::*;
