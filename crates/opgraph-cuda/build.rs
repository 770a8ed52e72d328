//! Build script for the CUDA backend.
//!
//! With the `cuda` feature, adds the toolkit's library directory to the link
//! search path so cudart, cuBLAS and cuRAND resolve. Without it there is
//! nothing to link and the simulated backend is used.
//!
//! # Environment Variables
//!
//! - `CUDA_PATH`: Path to the CUDA toolkit (common install paths are tried otherwise)

#[cfg(feature = "cuda")]
use std::env;
#[cfg(feature = "cuda")]
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=CUDA_PATH");

    #[cfg(feature = "cuda")]
    add_cuda_link_paths();
}

#[cfg(feature = "cuda")]
fn add_cuda_link_paths() {
    if let Ok(cuda_path) = env::var("CUDA_PATH") {
        for dir in ["lib64", "lib"] {
            let path = PathBuf::from(&cuda_path).join(dir);
            if path.exists() {
                println!("cargo:rustc-link-search=native={}", path.display());
            }
        }
        return;
    }

    let common_paths = [
        "/usr/local/cuda/lib64",
        "/usr/local/cuda/lib",
        "/opt/cuda/lib64",
    ];
    let mut found = false;
    for path in &common_paths {
        if PathBuf::from(path).exists() {
            println!("cargo:rustc-link-search=native={}", path);
            found = true;
        }
    }
    if !found {
        println!(
            "cargo:warning=CUDA libraries not found in common paths; set CUDA_PATH if linking fails"
        );
    }
}
