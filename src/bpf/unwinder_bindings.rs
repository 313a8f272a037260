#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

use plain::Plain;

// These records are read by the in-kernel unwinder programs. Layouts must
// match the unwinder's C headers field by field, every struct is keyed or
// copied byte-wise through the maps.

/// Marker for an offset the interpreter release does not have.
pub const UNSPECIFIED_OFFSET: u32 = u32::MAX;
/// Same marker for one-byte bit indices.
pub const UNSPECIFIED_BIT: u8 = u8::MAX;

/// Capacity of the per-binary thread local offset table.
pub const MAX_TLS_VARIABLES: usize = 8;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct python_runtime_state_offsets {
    pub py_interpreters_main: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct python_thread_state_offsets {
    pub cframe: u32,
    pub current_frame: u32,
    pub thread_id: u32,
    pub native_thread_id: u32,
    pub prev_thread: u32,
    pub next_thread: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct python_cframe_offsets {
    pub current_frame: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct python_frame_offsets {
    pub f_code: u32,
    pub previous: u32,
    pub owner: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct python_interpreter_state_offsets {
    pub next: u32,
    pub threads_head: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct python_code_object_offsets {
    pub co_firstlineno: u32,
    pub filename: u32,
    pub name: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct python_string_object_offsets {
    pub length: u32,
    pub data: u32,
    pub state: u32,
    pub ascii_bit: u8,
    pub compact_bit: u8,
    pub statically_allocated_bit: u8,
    pub _pad0: u8,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct python_tss_t_offsets {
    pub is_initialized: u32,
    pub key: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct python_internals_offsets {
    pub py_runtime_state_offsets: python_runtime_state_offsets,
    pub py_thread_state_offsets: python_thread_state_offsets,
    pub py_cframe_offsets: python_cframe_offsets,
    pub py_frame_offsets: python_frame_offsets,
    pub py_interpreter_state_offsets: python_interpreter_state_offsets,
    pub py_code_object_offsets: python_code_object_offsets,
    pub py_string_object_offsets: python_string_object_offsets,
    pub py_tss_t_offsets: python_tss_t_offsets,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct python_config {
    pub py_thread_state_tls_offset: u64,
    pub py_runtime_relative_address: u64,
    pub py_interp_head_relative_address: u64,
    pub auto_tss_key_relative_address: u64,
    pub version: u32,
    pub unicode_type_size_log2: u32,
    pub offsets: python_internals_offsets,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct pthread_key_data_offsets {
    pub size: u64,
    pub value_offset: u64,
    pub seq_offset: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct pthread_config {
    pub key_data: pthread_key_data_offsets,
    pub first_specific_block_offset: u64,
    pub specific_array_offset: u64,
    pub struct_pthread_pointer_offset: u64,
    pub key_second_level_size: u64,
    pub key_first_level_size: u64,
    pub keys_max: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct tls_binary_config {
    pub offsets: [u64; MAX_TLS_VARIABLES],
    pub count: u64,
}

/// One row of a binary's unwind table. The sampler binary-searches these by
/// `offset` within the enclosing segment.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct unwind_rule_t {
    pub offset: u16,
    pub cfa_type: u8,
    pub rbp_type: u8,
    pub cfa_offset: i16,
    pub rbp_offset: i16,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct unwind_segment_key {
    pub prefix_len: u32,
    pub address_space: u32,
    pub data: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct unwind_segment_t {
    pub binary_id: u64,
    pub begin: u64,
    pub end: u64,
}

unsafe impl Plain for python_config {}
unsafe impl Plain for pthread_config {}
unsafe impl Plain for tls_binary_config {}
unsafe impl Plain for unwind_rule_t {}
unsafe impl Plain for unwind_segment_key {}
unsafe impl Plain for unwind_segment_t {}

impl unwind_segment_key {
    pub fn new(address_space: u32, address: u64, prefix_len: u32) -> Self {
        // 32 bits of address space id plus 64 bits of address.
        let max_prefix_bits = (std::mem::size_of::<u32>() + std::mem::size_of::<u64>()) * 8;
        assert!(
            prefix_len as usize <= max_prefix_bits,
            "prefix_len {prefix_len} should be <= than the addressable bits of unwind_segment_key {max_prefix_bits}"
        );

        // The kernel trie matches prefixes over big endian bytes.
        Self {
            prefix_len,
            address_space: address_space.to_be(),
            data: address.to_be(),
        }
    }
}
