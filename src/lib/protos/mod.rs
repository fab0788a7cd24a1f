include!(concat!(env!("OUT_DIR"), "/protos/mod.rs"));
