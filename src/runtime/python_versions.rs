use std::collections::HashMap;

use lazy_static::lazy_static;
use thiserror::Error;

use crate::analysis::PythonVersion;
use crate::bpf::unwinder_bindings::python_cframe_offsets;
use crate::bpf::unwinder_bindings::python_code_object_offsets;
use crate::bpf::unwinder_bindings::python_frame_offsets;
use crate::bpf::unwinder_bindings::python_internals_offsets;
use crate::bpf::unwinder_bindings::python_interpreter_state_offsets;
use crate::bpf::unwinder_bindings::python_runtime_state_offsets;
use crate::bpf::unwinder_bindings::python_string_object_offsets;
use crate::bpf::unwinder_bindings::python_thread_state_offsets;
use crate::bpf::unwinder_bindings::python_tss_t_offsets;
use crate::bpf::unwinder_bindings::UNSPECIFIED_BIT;
use crate::bpf::unwinder_bindings::UNSPECIFIED_OFFSET;

/// Oldest interpreter the bundled offsets cover.
pub const MIN_SUPPORTED_VERSION: PythonVersion = PythonVersion {
    major: 3,
    minor: 8,
    micro: 0,
};

#[derive(Debug, Error)]
#[error("no offsets available for Python {0}")]
pub struct UnsupportedVersionError(pub PythonVersion);

/// Packs a version into the integer the unwinder compares against,
/// preserving release ordering.
pub fn encode_version(version: PythonVersion) -> u32 {
    version.micro + (version.minor << 8) + (version.major << 16)
}

/// True when offsets are bundled for this exact release. Versions below
/// [`MIN_SUPPORTED_VERSION`] are rejected without a table lookup.
pub fn is_version_supported(version: PythonVersion) -> bool {
    if encode_version(version) < encode_version(MIN_SUPPORTED_VERSION) {
        return false;
    }
    VERSION_OFFSETS.contains_key(&encode_version(version))
}

pub fn offsets_for_version(
    version: PythonVersion,
) -> Result<python_internals_offsets, UnsupportedVersionError> {
    if encode_version(version) < encode_version(MIN_SUPPORTED_VERSION) {
        return Err(UnsupportedVersionError(version));
    }
    VERSION_OFFSETS
        .get(&encode_version(version))
        .copied()
        .ok_or(UnsupportedVersionError(version))
}

lazy_static! {
    static ref VERSION_OFFSETS: HashMap<u32, python_internals_offsets> = version_table();
}

fn version_table() -> HashMap<u32, python_internals_offsets> {
    // (minor, last known micro, offsets). Offsets are condensed from the
    // generated per-release descriptions, micro releases of one minor share
    // a layout.
    let minors: [(u32, u32, python_internals_offsets); 6] = [
        (8, 20, OFFSETS_3_8),
        (9, 23, OFFSETS_3_9),
        (10, 18, OFFSETS_3_10),
        (11, 13, OFFSETS_3_11),
        (12, 11, OFFSETS_3_12),
        (13, 7, OFFSETS_3_13),
    ];

    let mut table = HashMap::new();
    for (minor, last_micro, offsets) in minors {
        for micro in 0..=last_micro {
            let version = PythonVersion {
                major: 3,
                minor,
                micro,
            };
            table.insert(encode_version(version), offsets);
        }
    }
    table
}

const OFFSETS_3_8: python_internals_offsets = python_internals_offsets {
    py_runtime_state_offsets: python_runtime_state_offsets {
        py_interpreters_main: 0x20,
    },
    py_thread_state_offsets: python_thread_state_offsets {
        cframe: UNSPECIFIED_OFFSET,
        current_frame: 0x18,
        thread_id: 0xa8,
        native_thread_id: UNSPECIFIED_OFFSET,
        prev_thread: 0x0,
        next_thread: 0x8,
    },
    py_cframe_offsets: python_cframe_offsets {
        current_frame: UNSPECIFIED_OFFSET,
    },
    py_frame_offsets: python_frame_offsets {
        f_code: 0x20,
        previous: 0x18,
        owner: UNSPECIFIED_OFFSET,
    },
    py_interpreter_state_offsets: python_interpreter_state_offsets {
        next: 0x0,
        threads_head: 0x8,
    },
    py_code_object_offsets: python_code_object_offsets {
        co_firstlineno: 0x28,
        filename: 0x68,
        name: 0x70,
    },
    py_string_object_offsets: python_string_object_offsets {
        length: 0x10,
        data: 0x30,
        state: 0x20,
        ascii_bit: 6,
        compact_bit: 5,
        statically_allocated_bit: UNSPECIFIED_BIT,
        _pad0: 0,
    },
    py_tss_t_offsets: python_tss_t_offsets {
        is_initialized: 0x0,
        key: 0x4,
    },
};

const OFFSETS_3_9: python_internals_offsets = python_internals_offsets {
    py_runtime_state_offsets: python_runtime_state_offsets {
        py_interpreters_main: 0x28,
    },
    py_thread_state_offsets: python_thread_state_offsets {
        cframe: UNSPECIFIED_OFFSET,
        current_frame: 0x18,
        thread_id: 0xb0,
        native_thread_id: UNSPECIFIED_OFFSET,
        prev_thread: 0x0,
        next_thread: 0x8,
    },
    py_cframe_offsets: python_cframe_offsets {
        current_frame: UNSPECIFIED_OFFSET,
    },
    py_frame_offsets: python_frame_offsets {
        f_code: 0x20,
        previous: 0x18,
        owner: UNSPECIFIED_OFFSET,
    },
    py_interpreter_state_offsets: python_interpreter_state_offsets {
        next: 0x0,
        threads_head: 0x8,
    },
    py_code_object_offsets: python_code_object_offsets {
        co_firstlineno: 0x28,
        filename: 0x68,
        name: 0x70,
    },
    py_string_object_offsets: python_string_object_offsets {
        length: 0x10,
        data: 0x30,
        state: 0x20,
        ascii_bit: 6,
        compact_bit: 5,
        statically_allocated_bit: UNSPECIFIED_BIT,
        _pad0: 0,
    },
    py_tss_t_offsets: python_tss_t_offsets {
        is_initialized: 0x0,
        key: 0x4,
    },
};

const OFFSETS_3_10: python_internals_offsets = python_internals_offsets {
    py_runtime_state_offsets: python_runtime_state_offsets {
        py_interpreters_main: 0x28,
    },
    py_thread_state_offsets: python_thread_state_offsets {
        // The live frame moved behind the cframe indirection.
        cframe: 0x20,
        current_frame: UNSPECIFIED_OFFSET,
        thread_id: 0xb8,
        native_thread_id: UNSPECIFIED_OFFSET,
        prev_thread: 0x0,
        next_thread: 0x8,
    },
    py_cframe_offsets: python_cframe_offsets { current_frame: 0x8 },
    py_frame_offsets: python_frame_offsets {
        f_code: 0x20,
        previous: 0x18,
        owner: UNSPECIFIED_OFFSET,
    },
    py_interpreter_state_offsets: python_interpreter_state_offsets {
        next: 0x0,
        threads_head: 0x8,
    },
    py_code_object_offsets: python_code_object_offsets {
        co_firstlineno: 0x28,
        filename: 0x68,
        name: 0x70,
    },
    py_string_object_offsets: python_string_object_offsets {
        length: 0x10,
        data: 0x30,
        state: 0x20,
        ascii_bit: 6,
        compact_bit: 5,
        statically_allocated_bit: UNSPECIFIED_BIT,
        _pad0: 0,
    },
    py_tss_t_offsets: python_tss_t_offsets {
        is_initialized: 0x0,
        key: 0x4,
    },
};

const OFFSETS_3_11: python_internals_offsets = python_internals_offsets {
    py_runtime_state_offsets: python_runtime_state_offsets {
        py_interpreters_main: 0x30,
    },
    py_thread_state_offsets: python_thread_state_offsets {
        cframe: 0x38,
        current_frame: UNSPECIFIED_OFFSET,
        thread_id: 0x98,
        native_thread_id: 0xa0,
        prev_thread: 0x0,
        next_thread: 0x8,
    },
    py_cframe_offsets: python_cframe_offsets { current_frame: 0x8 },
    // Interpreter frames replaced the heap frame objects.
    py_frame_offsets: python_frame_offsets {
        f_code: 0x18,
        previous: 0x28,
        owner: 0x44,
    },
    py_interpreter_state_offsets: python_interpreter_state_offsets {
        next: 0x8,
        threads_head: 0x18,
    },
    py_code_object_offsets: python_code_object_offsets {
        co_firstlineno: 0x44,
        filename: 0x70,
        name: 0x78,
    },
    py_string_object_offsets: python_string_object_offsets {
        length: 0x10,
        data: 0x30,
        state: 0x20,
        ascii_bit: 6,
        compact_bit: 5,
        statically_allocated_bit: UNSPECIFIED_BIT,
        _pad0: 0,
    },
    py_tss_t_offsets: python_tss_t_offsets {
        is_initialized: 0x0,
        key: 0x4,
    },
};

const OFFSETS_3_12: python_internals_offsets = python_internals_offsets {
    py_runtime_state_offsets: python_runtime_state_offsets {
        py_interpreters_main: 0x30,
    },
    py_thread_state_offsets: python_thread_state_offsets {
        cframe: 0x38,
        current_frame: UNSPECIFIED_OFFSET,
        thread_id: 0x88,
        native_thread_id: 0x90,
        prev_thread: 0x0,
        next_thread: 0x8,
    },
    py_cframe_offsets: python_cframe_offsets { current_frame: 0x0 },
    py_frame_offsets: python_frame_offsets {
        f_code: 0x20,
        previous: 0x28,
        owner: 0x42,
    },
    py_interpreter_state_offsets: python_interpreter_state_offsets {
        next: 0x8,
        threads_head: 0x48,
    },
    py_code_object_offsets: python_code_object_offsets {
        co_firstlineno: 0x48,
        filename: 0x78,
        name: 0x80,
    },
    py_string_object_offsets: python_string_object_offsets {
        length: 0x10,
        data: 0x30,
        state: 0x20,
        ascii_bit: 6,
        compact_bit: 5,
        statically_allocated_bit: 7,
        _pad0: 0,
    },
    py_tss_t_offsets: python_tss_t_offsets {
        is_initialized: 0x0,
        key: 0x4,
    },
};

const OFFSETS_3_13: python_internals_offsets = python_internals_offsets {
    py_runtime_state_offsets: python_runtime_state_offsets {
        py_interpreters_main: 0x38,
    },
    py_thread_state_offsets: python_thread_state_offsets {
        // The cframe indirection is gone again.
        cframe: UNSPECIFIED_OFFSET,
        current_frame: 0x48,
        thread_id: 0x80,
        native_thread_id: 0x88,
        prev_thread: 0x0,
        next_thread: 0x8,
    },
    py_cframe_offsets: python_cframe_offsets {
        current_frame: UNSPECIFIED_OFFSET,
    },
    py_frame_offsets: python_frame_offsets {
        f_code: 0x28,
        previous: 0x30,
        owner: 0x46,
    },
    py_interpreter_state_offsets: python_interpreter_state_offsets {
        next: 0x8,
        threads_head: 0x50,
    },
    py_code_object_offsets: python_code_object_offsets {
        co_firstlineno: 0x4c,
        filename: 0x80,
        name: 0x88,
    },
    py_string_object_offsets: python_string_object_offsets {
        length: 0x10,
        data: 0x28,
        state: 0x20,
        ascii_bit: 6,
        compact_bit: 5,
        statically_allocated_bit: 7,
        _pad0: 0,
    },
    py_tss_t_offsets: python_tss_t_offsets {
        is_initialized: 0x0,
        key: 0x4,
    },
};
