use std::io;

fn main() -> io::Result<()> {
    build_proto()?;
    Ok(())
}

fn build_proto() -> io::Result<()> {
    println!("cargo:rerun-if-changed=protos/raft.proto");
    tonic_build::configure().compile(&["./protos/raft.proto"], &["./protos/"])
}
