use std::{
  fs,
  path::{Path, PathBuf},
};

use anyhow::{anyhow, Result};
use duct::cmd;
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone, Copy, Hash, PartialEq, Eq)]
struct LocateProject<'a> {
  root: &'a str,
}

fn find_workspace() -> Result<PathBuf> {
  let json = cmd!("cargo", "locate-project", "--workspace").read()?;

  let parsed = serde_json::from_str::<LocateProject>(&json)?;
  let manifest: &Path = parsed.root.as_ref();
  manifest
    .parent()
    .map(Path::to_owned)
    .ok_or_else(|| anyhow!("workspace manifest {} has no parent", manifest.display()))
}

/// Regenerates `crates/proto/src/v1beta1/proto.rs` from `proto/v1beta1.proto`.
fn main() -> Result<()> {
  let root = find_workspace()?;
  let proto_dir = root.join("proto");
  let out_dir = root.join("target").join("proto");
  let api_file = proto_dir.join("v1beta1.proto");

  fs::create_dir_all(&out_dir)?;

  let mut config = prost_build::Config::default();
  config.protoc_arg(format!("-I={}", proto_dir.display()));

  tonic_build::configure()
    .out_dir(&out_dir)
    .build_client(true)
    .build_server(true)
    .compile_with_config(config, &[&api_file], &[&proto_dir])?;

  let generated = out_dir.join("v1beta1.rs");
  let target = root
    .join("crates")
    .join("proto")
    .join("src")
    .join("v1beta1")
    .join("proto.rs");

  if target.is_file() {
    fs::remove_file(&target)?;
  }

  fs::copy(&generated, &target)?;
  println!("wrote {}", target.display());

  Ok(())
}
