//! Generated protobuf modules
//!
//! build.rs compiles every .proto under `protos/`; prost emits one file per
//! package (meshtastic.rs) which is wrapped here.

pub mod meshtastic_generated {
    //! Generated Meshtastic protobuf types.
    #[allow(dead_code, unused_imports, unused_variables, unused_mut, unused_macros)]
    #[allow(clippy::all)]
    // Generated docs can contain tag-like text
    #[allow(rustdoc::invalid_html_tags)]
    mod inner {
        include!(concat!(env!("OUT_DIR"), "/meshtastic.rs"));
    }
    pub use inner::*;
}

pub use meshtastic_generated as proto;
