//! Purpose: `meshbridge` CLI entry point and command dispatch.
//! Role: Binary crate root; parses args, drives the in-process reference engine through
//!       the effect pipeline, emits JSON on stdout.
//! Invariants: Commands emit JSON on stdout; logs and notices go to stderr.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Every node a command creates is destroyed before the command returns.
#![allow(clippy::result_large_err)]

use std::error::Error as StdError;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::error::ErrorKind as ClapErrorKind;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum, ValueHint};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};

use meshbridge::api::{
    EffectOutcome, EffectRequest, Error, ErrorKind, HostValue, MeshData, MeshJson, MeshLayout,
    ParameterDescriptor, ParmValues, Readiness, RuntimeConfig, RuntimeContext, SessionManager,
    SessionOptions, cook_effect, describe_parameters, discover_plugins, to_exit_code,
};
use meshbridge::core::engine::memory::MemoryEngine;
use meshbridge::library_paths::library_path;
use meshbridge::logging;
use meshbridge::notice::{Notice, notice_json};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(clap_error_summary(&err))
                        .with_hint("run `meshbridge --help` for usage"),
                    ColorMode::Auto,
                ));
            }
        },
    };

    logging::init(cli.log.as_deref());
    let color_mode = cli.color;
    dispatch(cli).map_err(|err| (err, color_mode))
}

#[derive(Parser)]
#[command(
    name = "meshbridge",
    version,
    about = "Cook procedural assets into host meshes",
    long_about = r#"Load an asset library, inspect its assets and cook them into meshes.

Runs the in-process reference engine: asset libraries are JSON files describing
assets, their parameters and their geometry."#,
    after_help = r#"EXAMPLES
  $ meshbridge --library shapes.json assets
  $ meshbridge --library shapes.json describe --asset Sop/shift
  $ meshbridge --library shapes.json cook --asset Sop/shift --input tri.json --set mfx_offset=0,0,1

ENVIRONMENT
  MESHBRIDGE_LIBRARY  asset library used when --library is not given
  MESHBRIDGE_LOG      log filter (default: warn)"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        help = "Asset library (default: $MESHBRIDGE_LIBRARY, then library.hda next to the binary)",
        value_hint = ValueHint::FilePath
    )]
    library: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        help = "Log filter directive, e.g. `info` or `meshbridge=debug` (overrides MESHBRIDGE_LOG)"
    )]
    log: Option<String>,
    #[arg(
        long,
        global = true,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "List the assets a library exposes as plugins",
        after_help = r#"EXAMPLES
  $ meshbridge --library shapes.json assets
  $ meshbridge --library shapes.json assets --max-plugins 50"#
    )]
    Assets {
        #[arg(long, help = "Maximum number of plugins to list (default: 10)")]
        max_plugins: Option<usize>,
    },
    #[command(
        arg_required_else_help = true,
        about = "Show the parameters an asset surfaces to the host",
        after_help = r#"EXAMPLES
  $ meshbridge --library shapes.json describe --asset Sop/shift
  $ meshbridge --library shapes.json describe --asset 0 --prefix p_"#
    )]
    Describe {
        #[arg(long, help = "Asset name or index")]
        asset: String,
        #[arg(long, help = "Parameter name prefix (default: mfx_)")]
        prefix: Option<String>,
    },
    #[command(
        arg_required_else_help = true,
        about = "Cook an asset and print the resulting mesh",
        long_about = r#"Cook an asset and print the resulting mesh.

The input mesh (if any) is fed into the asset's input, parameters are applied,
the asset is cooked and its consolidated output geometry is printed as JSON."#,
        after_help = r#"EXAMPLES
  $ meshbridge cook --asset Sop/shift --input tri.json
  $ meshbridge cook --asset Sop/shift --input - --set mfx_offset=0,0,2 < tri.json
  $ meshbridge cook --asset Obj/scatter --interleaved

NOTES
  - Mesh JSON: {"points": [[x,y,z]], "vertices": [i], "faces": [n], "attributes": {..}}
  - A cook that is not ready prints a notice on stderr and no mesh."#
    )]
    Cook {
        #[arg(long, help = "Asset name or index")]
        asset: String,
        #[arg(long, help = "Input mesh JSON file (`-` for stdin)", value_hint = ValueHint::FilePath)]
        input: Option<PathBuf>,
        #[arg(
            long = "set",
            value_name = "NAME=V[,V..]",
            help = "Parameter value (repeatable)"
        )]
        set: Vec<String>,
        #[arg(long, help = "Use interleaved (strided) host buffers")]
        interleaved: bool,
        #[arg(long, help = "Parameter name prefix (default: mfx_)")]
        prefix: Option<String>,
    },
    #[command(
        arg_required_else_help = true,
        about = "Generate shell completions",
        after_help = r#"EXAMPLES
  $ meshbridge completion bash > ~/.local/share/bash-completion/completions/meshbridge
  $ meshbridge completion zsh > ~/.zfunc/_meshbridge
  $ meshbridge completion fish > ~/.config/fish/completions/meshbridge.fish"#
    )]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

fn dispatch(cli: Cli) -> Result<RunOutcome, Error> {
    let library = cli.library;
    let color_mode = cli.color;
    match cli.command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "meshbridge", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Assets { max_plugins } => {
            let path = resolve_library(library.as_deref())?;
            let mut config = RuntimeConfig::default();
            if let Some(max_plugins) = max_plugins {
                config = config.with_max_plugins(max_plugins);
            }
            let manager = session_manager();
            let plugins = discover_plugins(manager.acquire()?, &config, &path)?;
            let assets: Vec<Value> = plugins
                .iter()
                .map(|plugin| json!({"index": plugin.index, "identifier": plugin.identifier}))
                .collect();
            emit_json(json!({"library": path, "assets": assets}));
            Ok(RunOutcome::ok())
        }
        Command::Describe { asset, prefix } => {
            let mut runtime = open_runtime(library.as_deref(), prefix)?;
            let name = select_asset(&mut runtime, &asset)?;
            let parameters = describe_parameters(&mut runtime)?;
            let parameters: Vec<Value> = parameters.iter().map(parameter_json).collect();
            emit_json(json!({"asset": name, "parameters": parameters}));
            Ok(RunOutcome::ok())
        }
        Command::Cook {
            asset,
            input,
            set,
            interleaved,
            prefix,
        } => {
            let layout = if interleaved {
                MeshLayout::Interleaved
            } else {
                MeshLayout::Packed
            };
            let input = input
                .as_deref()
                .map(|path| read_mesh(path, layout))
                .transpose()?;
            let mut runtime = open_runtime(library.as_deref(), prefix)?;
            let name = select_asset(&mut runtime, &asset)?;
            runtime.create_node()?;
            let cooked = cook(&mut runtime, input.as_ref(), &set, layout);
            let destroyed = runtime.destroy_node();
            let outcome = cooked?;
            destroyed?;
            report_cook(&name, outcome, color_mode)
        }
    }
}

fn session_manager() -> SessionManager {
    SessionManager::new(Arc::new(MemoryEngine::new()), SessionOptions::in_process())
}

fn resolve_library(explicit: Option<&Path>) -> Result<String, Error> {
    let path = library_path(explicit)?;
    path.to_str().map(str::to_string).ok_or_else(|| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("library path is not valid UTF-8: {}", path.display()))
    })
}

fn open_runtime(library: Option<&Path>, prefix: Option<String>) -> Result<RuntimeContext, Error> {
    let path = resolve_library(library)?;
    let mut config = RuntimeConfig::default();
    if let Some(prefix) = prefix {
        config = config.with_parameter_prefix(prefix);
    }
    // The runtime's session reference keeps the engine alive past the manager.
    let session = session_manager().acquire()?;
    let mut runtime = RuntimeContext::new(session, config);
    runtime.set_library(&path)?;
    Ok(runtime)
}

/// Selects by exact identifier first, then by index.
fn select_asset(runtime: &mut RuntimeContext, asset: &str) -> Result<String, Error> {
    let names = runtime.asset_names()?;
    let index = names
        .iter()
        .position(|name| name == asset)
        .or_else(|| asset.parse::<usize>().ok().filter(|index| *index < names.len()))
        .ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("unknown asset `{asset}`"))
                .with_hint("run `meshbridge assets` to list available assets")
        })?;
    runtime.select_asset(index)?;
    Ok(names[index].clone())
}

fn read_mesh(path: &Path, layout: MeshLayout) -> Result<MeshData, Error> {
    let text = if path == Path::new("-") {
        let mut text = String::new();
        io::stdin().read_to_string(&mut text).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read mesh from stdin")
                .with_source(err)
        })?;
        text
    } else {
        std::fs::read_to_string(path).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message(format!("failed to read mesh {}", path.display()))
                .with_source(err)
        })?
    };
    let json: MeshJson = serde_json::from_str(&text).map_err(|err| {
        Error::new(ErrorKind::Corrupt)
            .with_message("invalid mesh json")
            .with_hint("expected {\"points\": [[x,y,z]], \"vertices\": [..], \"faces\": [..]}")
            .with_source(err)
    })?;
    MeshData::from_json(&json, layout)
}

fn cook(
    runtime: &mut RuntimeContext,
    input: Option<&MeshData>,
    assignments: &[String],
    layout: MeshLayout,
) -> Result<EffectOutcome, Error> {
    runtime.fetch_parameters()?;
    let parameters = assignments
        .iter()
        .map(|raw| parse_assignment(runtime, raw))
        .collect::<Result<Vec<_>, Error>>()?;
    let request = EffectRequest {
        input,
        parameters,
        layout,
    };
    cook_effect(runtime, &request)
}

/// `name=v[,v..]`; integers when the parameter stores ints, text when values are not numeric.
fn parse_assignment(runtime: &RuntimeContext, raw: &str) -> Result<(String, HostValue), Error> {
    let Some((name, values)) = raw.split_once('=') else {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("invalid parameter assignment `{raw}`"))
            .with_hint("use --set name=value or --set name=v1,v2,v3"));
    };
    let name = name.trim();
    let stores_ints = runtime
        .parameter_index(name)
        .and_then(|index| runtime.parameters().and_then(|parms| parms.get(index)))
        .is_some_and(|parm| parm.parm_type.uses_int_storage());
    let parts: Vec<&str> = values.split(',').map(str::trim).collect();

    if stores_ints {
        if let Ok(ints) = parts.iter().map(|v| v.parse::<i32>()).collect::<Result<Vec<_>, _>>() {
            return Ok((name.to_string(), HostValue::Integers(ints)));
        }
    }
    let value = match parts.iter().map(|v| v.parse::<f64>()).collect::<Result<Vec<_>, _>>() {
        Ok(doubles) => HostValue::Doubles(doubles),
        Err(_) => HostValue::String(values.to_string()),
    };
    Ok((name.to_string(), value))
}

fn report_cook(asset: &str, outcome: EffectOutcome, color_mode: ColorMode) -> Result<RunOutcome, Error> {
    match outcome {
        EffectOutcome::Skipped { state } => {
            let notice = Notice::new("skipped", "cook", asset, "cook not ready; no output read")
                .with_detail("state", state.raw());
            emit_notice(&notice, color_mode);
            emit_json(json!({"asset": asset, "state": state.raw(), "skipped": true}));
        }
        EffectOutcome::Cooked {
            mesh,
            counts,
            readiness,
            state,
        } => {
            if readiness == Readiness::ReadyWithWarning {
                let message = state.warning().unwrap_or("cook finished with errors");
                let notice = Notice::new("cook_warning", "cook", asset, message)
                    .with_detail("state", state.raw());
                emit_notice(&notice, color_mode);
            }
            let mesh = serde_json::to_value(mesh.to_json()).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to encode mesh")
                    .with_source(err)
            })?;
            emit_json(json!({
                "asset": asset,
                "state": state.raw(),
                "counts": {
                    "points": counts.points,
                    "vertices": counts.vertices,
                    "faces": counts.faces,
                },
                "mesh": mesh,
            }));
        }
    }
    Ok(RunOutcome::ok())
}

fn parameter_json(parameter: &ParameterDescriptor) -> Value {
    let default = match &parameter.default {
        Some(ParmValues::Float(values)) => json!(values),
        Some(ParmValues::Int(values)) => json!(values),
        None => Value::Null,
    };
    json!({
        "index": parameter.index,
        "name": parameter.name,
        "type": parameter.host_type.as_str(),
        "size": parameter.size,
        "default": default,
    })
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn emit_notice(notice: &Notice, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        let label = colorize_label("notice:", color_mode.use_color(is_tty), AnsiColor::Yellow);
        eprintln!("{label} {} (asset: {})", notice.message, notice.asset);
        return;
    }

    let value = notice_json(notice);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"notice\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::Session => "engine session unavailable".to_string(),
        ErrorKind::Library => "asset library error".to_string(),
        ErrorKind::Node => "node error".to_string(),
        ErrorKind::Parameter => "parameter error".to_string(),
        ErrorKind::Geometry => "geometry error".to_string(),
        ErrorKind::Unsupported => "unsupported".to_string(),
        ErrorKind::Contract => "buffer contract violated".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
        ErrorKind::Corrupt => "corrupt data".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(code) = err.engine_code() {
        inner.insert(
            "engine_code".to_string(),
            json!({"code": code.raw(), "message": code.message()}),
        );
    }
    if let Some(node) = err.node() {
        inner.insert("node".to_string(), json!(node.0));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    ));
    if let Some(hint) = err.hint() {
        lines.push(format!(
            "{} {hint}",
            colorize_label("hint:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(code) = err.engine_code() {
        lines.push(format!(
            "{} {} ({})",
            colorize_label("engine:", use_color, AnsiColor::Yellow),
            code.raw(),
            code.message()
        ));
    }
    if let Some(node) = err.node() {
        lines.push(format!(
            "{} {node}",
            colorize_label("node:", use_color, AnsiColor::Yellow)
        ));
    }
    for cause in error_causes(err) {
        lines.push(format!(
            "{} {cause}",
            colorize_label("caused by:", use_color, AnsiColor::Yellow)
        ));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    let rendered = err.to_string();
    rendered
        .lines()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.trim_start_matches("error:").trim().to_string())
        .unwrap_or_else(|| "invalid arguments".to_string())
}

#[cfg(test)]
mod tests {
    use super::{Cli, Command, error_json, error_text, parse_assignment};
    use clap::Parser;
    use meshbridge::api::{
        Error, ErrorKind, HostValue, RuntimeConfig, RuntimeContext, SessionManager,
        SessionOptions,
    };
    use meshbridge::core::engine::memory::MemoryEngine;
    use meshbridge::core::engine::{NodeId, ResultCode};
    use std::sync::Arc;

    #[test]
    fn cook_accepts_repeated_sets() {
        let cli = Cli::try_parse_from([
            "meshbridge",
            "--library",
            "lib.json",
            "cook",
            "--asset",
            "Sop/shift",
            "--set",
            "mfx_offset=0,0,1",
            "--set",
            "mfx_count=3",
            "--interleaved",
        ])
        .expect("parse");
        match cli.command {
            Command::Cook {
                set, interleaved, ..
            } => {
                assert_eq!(set, ["mfx_offset=0,0,1", "mfx_count=3"]);
                assert!(interleaved);
            }
            _ => panic!("expected cook"),
        }
    }

    #[test]
    fn assignments_follow_parameter_storage() {
        let engine = Arc::new(MemoryEngine::new());
        engine.install_library(
            "lib.json",
            r#"{"assets": [{"name": "Sop/p", "parms": [
                {"name": "mfx_count", "type": "int"},
                {"name": "mfx_scale", "type": "float"}]}]}"#,
        );
        let manager = SessionManager::new(engine, SessionOptions::in_process());
        let mut runtime =
            RuntimeContext::new(manager.acquire().expect("session"), RuntimeConfig::default());
        runtime.set_library("lib.json").expect("library");
        runtime.select_asset(0).expect("select");
        runtime.create_node().expect("node");
        runtime.fetch_parameters().expect("parms");

        let (_, value) = parse_assignment(&runtime, "mfx_count=3").expect("int");
        assert_eq!(value, HostValue::Integers(vec![3]));
        let (_, value) = parse_assignment(&runtime, "mfx_scale=3").expect("float");
        assert_eq!(value, HostValue::Doubles(vec![3.0]));
        let (_, value) = parse_assignment(&runtime, "mfx_scale=big").expect("text");
        assert_eq!(value, HostValue::String("big".to_string()));
        let err = parse_assignment(&runtime, "mfx_scale").expect_err("no value");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn error_json_carries_engine_code_and_node() {
        let err = Error::new(ErrorKind::Node)
            .with_message("cook failed")
            .with_engine_code(ResultCode::NodeInvalid)
            .with_node(NodeId(4));
        let value = error_json(&err);
        let inner = value.get("error").expect("error object");
        assert_eq!(inner["kind"], "Node");
        assert_eq!(inner["engine_code"]["code"], 210);
        assert_eq!(inner["node"], 4);
    }

    #[test]
    fn error_text_respects_color_flag() {
        let err = Error::new(ErrorKind::Usage)
            .with_message("bad")
            .with_hint("try again");
        let plain = error_text(&err, false);
        assert!(plain.starts_with("error: bad"));
        assert!(plain.contains("hint: try again"));
        assert!(error_text(&err, true).contains("\u{1b}[31m"));
    }
}
