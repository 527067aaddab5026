//! Generates foreign bindings for the client-side stores of `aicurate-core`:
//!
//! ```sh
//! cargo run -p uniffi-bindgen -- generate --library target/release/libaicurate_core.dylib --language swift --out-dir bindings/swift
//! ```

fn main() {
    uniffi::uniffi_bindgen_main();
}
