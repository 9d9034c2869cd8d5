// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Writes the `VirtualMachineInstance` CRD generated from src/crd.rs.
//!
//! Meant for test clusters that run the handler without the full
//! virtualization control plane, which normally owns this CRD.
//!
//! Usage:
//!   cargo run --bin crdgen
//!   cargo run --bin crdgen -- --stdout | kubectl apply -f -

use anyhow::{Context as _, Result};
use clap::Parser;
use handoff::crd::VirtualMachineInstance;
use kube::CustomResourceExt;
use serde_json::{Map, Value};
use std::fs;
use std::path::PathBuf;

const CRD_FILE_NAME: &str = "virtualmachineinstances.crd.yaml";

const GENERATED_HEADER: &str = "# Copyright (c) 2025 Erick Bourgeois, firestoned
# SPDX-License-Identifier: MIT
#
# Generated from src/crd.rs by `cargo run --bin crdgen`; edits are overwritten.
";

#[derive(Parser, Debug)]
#[command(about = "Generate the VirtualMachineInstance CRD manifest")]
struct Args {
    /// Directory the manifest is written to
    #[arg(long, default_value = "deploy/crds")]
    output_dir: PathBuf,

    /// Print the manifest instead of writing a file
    #[arg(long)]
    stdout: bool,
}

/// CRD manifest with every version served and the status subresource enabled.
///
/// Node handlers write migration state through `/status` only.
fn render_crd() -> Result<String> {
    let mut crd: Value = serde_json::to_value(VirtualMachineInstance::crd())?;
    let versions = crd["spec"]["versions"]
        .as_array_mut()
        .context("generated CRD has no versions")?;
    for version in versions {
        version["served"] = Value::Bool(true);
        version["storage"] = Value::Bool(true);
        version["subresources"]["status"] = Value::Object(Map::new());
    }
    Ok(format!("{GENERATED_HEADER}{}", serde_yaml::to_string(&crd)?))
}

fn main() -> Result<()> {
    let args = Args::parse();
    let manifest = render_crd()?;

    if args.stdout {
        print!("{manifest}");
        return Ok(());
    }

    fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("failed to create {}", args.output_dir.display()))?;
    let path = args.output_dir.join(CRD_FILE_NAME);
    fs::write(&path, manifest).with_context(|| format!("failed to write {}", path.display()))?;
    eprintln!("Wrote {}", path.display());

    Ok(())
}
