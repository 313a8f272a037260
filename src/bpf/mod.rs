pub mod unwinder_bindings;
