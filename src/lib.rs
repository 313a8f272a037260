pub mod analysis;
pub mod bpf;
pub mod kallsyms;
pub mod links;
pub mod manager;
pub mod maps;
pub mod runtime;
pub mod segments;
pub mod symbols;
pub mod unwind_table;
pub mod uprobe;
pub mod util;
