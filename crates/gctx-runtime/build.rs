//! Build script for gctx-runtime
//!
//! Generates `OUT_DIR/gctx_defaults.rs` with the compile-time defaults of
//! `RuntimeConfig`:
//! 1. Start with library defaults
//! 2. If GCTX_CONFIG_RS names a file, parse its `pub const` lines
//! 3. Known names from the file override the defaults
//!
//! The user file only needs the values it wants to change.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

struct ConfigParam {
    name: &'static str,
    rust_type: &'static str,
    default_value: &'static str,
}

const CONFIG_PARAMS: &[ConfigParam] = &[
    ConfigParam { name: "STACK_SIZE", rust_type: "usize", default_value: "256 * 1024" },
    ConfigParam { name: "STACK_POOL_SLOTS", rust_type: "usize", default_value: "64" },
    ConfigParam { name: "STACK_GUARD", rust_type: "bool", default_value: "true" },
    ConfigParam { name: "STACK_PROFILING", rust_type: "bool", default_value: "false" },
    ConfigParam { name: "STACK_WARN_PERCENT", rust_type: "u8", default_value: "80" },
    ConfigParam { name: "SLICE_WARNING_MS", rust_type: "u64", default_value: "100" },
    ConfigParam { name: "PARK_TIMEOUT_MS", rust_type: "u64", default_value: "10" },
    ConfigParam { name: "OLE_THREADS", rust_type: "usize", default_value: "4" },
    ConfigParam { name: "IOS_HISTORY", rust_type: "bool", default_value: "false" },
    ConfigParam { name: "DEBUG_LOGGING", rust_type: "bool", default_value: "false" },
];

fn main() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");
    let dest_path = Path::new(&out_dir).join("gctx_defaults.rs");

    let mut config: HashMap<&str, String> = CONFIG_PARAMS
        .iter()
        .map(|p| (p.name, p.default_value.to_string()))
        .collect();

    let user_path = env::var("GCTX_CONFIG_RS").ok();
    if let Some(path) = &user_path {
        println!("cargo:rerun-if-changed={}", path);
        match fs::read_to_string(path) {
            Ok(content) => {
                merge(&content, &mut config);
                println!("cargo:warning=Using custom config: {}", path);
            }
            Err(e) => println!("cargo:warning=Failed to read GCTX_CONFIG_RS ({}): {}", path, e),
        }
    }
    println!("cargo:rerun-if-env-changed=GCTX_CONFIG_RS");

    fs::write(&dest_path, render(&config, user_path.as_deref()))
        .expect("Failed to write generated defaults");
}

/// Merge `pub const NAME: TYPE = VALUE;` lines over `config`
fn merge(content: &str, config: &mut HashMap<&str, String>) {
    for line in content.lines().map(str::trim) {
        if !line.starts_with("pub const ") {
            continue;
        }
        let Some((name, value)) = parse_const_line(line) else {
            continue;
        };
        match CONFIG_PARAMS.iter().find(|p| p.name == name) {
            Some(param) => {
                config.insert(param.name, value);
            }
            None => println!("cargo:warning=Unknown config parameter: {}", name),
        }
    }
}

fn parse_const_line(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("pub const ")?.trim();
    let colon = rest.find(':')?;
    let eq = rest.find('=')?;
    let semi = rest.rfind(';').unwrap_or(rest.len());
    if eq < colon || semi < eq {
        return None;
    }
    Some((rest[..colon].trim().to_string(), rest[eq + 1..semi].trim().to_string()))
}

fn render(config: &HashMap<&str, String>, user_path: Option<&str>) -> String {
    let mut out = String::from("// Generated by gctx-runtime/build.rs\n");
    if let Some(path) = user_path {
        out.push_str(&format!("// Overrides from {}\n", path));
    }
    out.push('\n');
    for param in CONFIG_PARAMS {
        let value = config.get(param.name).map_or(param.default_value, String::as_str);
        out.push_str(&format!("pub const {}: {} = {};\n", param.name, param.rust_type, value));
    }
    out
}
