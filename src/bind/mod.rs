// Module for choosing which engine serves a statement
pub mod resolver;
pub mod selector;

pub use resolver::{BindContext, BindResolver, PrimaryBind, TableBinds, is_write_intent};
pub use selector::{BindSelector, sticky_index};
