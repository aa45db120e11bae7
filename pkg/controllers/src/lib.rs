pub mod binder;
pub mod scheduling;
