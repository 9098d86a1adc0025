use std::{
    env, fs,
    io::{self, Write},
    process::ExitCode,
    rc::Rc,
};

use lupine::{
    BridgeConfig, BridgeError, BridgeTracer, HostFunction, HostList, LogTracer, NoopTracer, ProfilingTracer, Runtime,
    Value, as_function, as_itemgetter, smallvec,
};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: lupine [--config FILE] [--trace | --profile] [SCRIPT [ARGS...]]";

#[derive(Debug, Default)]
struct Options {
    config: Option<String>,
    trace: bool,
    profile: bool,
    script: Option<String>,
    script_args: Vec<String>,
}

fn main() -> ExitCode {
    let options = match parse_args(env::args().skip(1)) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("{err}\n{USAGE}");
            return ExitCode::FAILURE;
        }
    };

    let config = match &options.config {
        Some(path) => match read_config(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("{err}");
                return ExitCode::FAILURE;
            }
        },
        None => BridgeConfig::default(),
    };

    let profiler = ProfilingTracer::new();
    let tracer: Box<dyn BridgeTracer> = if options.trace {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lupine=debug")))
            .with_writer(io::stderr)
            .init();
        Box::new(LogTracer)
    } else if options.profile {
        Box::new(profiler.clone())
    } else {
        Box::new(NoopTracer)
    };

    let runtime = match Runtime::with_tracer(config, tracer) {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = install_host_library(&runtime, &options.script_args) {
        eprintln!("error: {err}");
        return ExitCode::FAILURE;
    }

    let code = match &options.script {
        Some(path) => run_script(&runtime, path),
        None => repl(&runtime),
    };
    if options.profile {
        eprintln!("{}", profiler.report());
    }
    code
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Options, String> {
    let mut options = Options::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().ok_or("--config needs a file")?;
                options.config = Some(path);
            }
            "--trace" => options.trace = true,
            "--profile" => options.profile = true,
            "-h" | "--help" => return Err("lupine: run Lua scripts with host callbacks".to_owned()),
            flag if flag.starts_with("--") => return Err(format!("unknown option {flag}")),
            _ => {
                options.script = Some(arg);
                options.script_args = args.collect();
                break;
            }
        }
    }
    if options.trace && options.profile {
        return Err("--trace and --profile cannot be combined".to_owned());
    }
    Ok(options)
}

fn read_config(path: &str) -> Result<BridgeConfig, String> {
    let text = fs::read_to_string(path).map_err(|err| format!("error reading {path}: {err}"))?;
    let config: BridgeConfig = serde_json::from_str(&text).map_err(|err| format!("invalid config {path}: {err}"))?;
    config.validate().map_err(|err| err.to_string())?;
    Ok(config)
}

/// Adds `args` (the script arguments) and `env(name)` to the bridge library.
fn install_host_library(runtime: &Runtime, script_args: &[String]) -> Result<(), BridgeError> {
    let library = runtime.library()?;
    let args = HostList::new(script_args.iter().map(|arg| Value::from(arg.as_str())));
    library.set("args", as_itemgetter(Rc::new(args)))?;

    let env = HostFunction::named("env", |_, args| {
        let name = args.first().map_or(Ok(""), Value::to_str)?;
        Ok(smallvec![env::var(name).ok().into()])
    });
    library.set("env", as_function(Rc::new(env)))?;
    Ok(())
}

fn run_script(runtime: &Runtime, path: &str) -> ExitCode {
    tracing::debug!(target: "lupine", script = path, "running script");
    let source = match fs::read(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error reading {path}: {err}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.load(source, path).and_then(|chunk| chunk.call([])) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        }
    }
}

fn repl(runtime: &Runtime) -> ExitCode {
    let mut source = String::new();
    loop {
        let prompt = if source.is_empty() { ">>> " } else { "... " };
        let Some(line) = read_line(prompt) else {
            println!();
            break;
        };

        if source.is_empty() && line.trim().is_empty() {
            continue;
        }
        if !source.is_empty() {
            source.push('\n');
        }
        source.push_str(&line);

        match execute_snippet(runtime, &source) {
            Snippet::Incomplete => continue,
            Snippet::Done(values) => {
                if !values.is_empty() {
                    println!("{}", values.join("\t"));
                }
            }
            Snippet::Failed(err) => report(&err),
        }
        source.clear();
    }
    ExitCode::SUCCESS
}

enum Snippet {
    Done(Vec<String>),
    Incomplete,
    Failed(BridgeError),
}

/// Runs one snippet, first as an expression and then as a chunk.
fn execute_snippet(runtime: &Runtime, source: &str) -> Snippet {
    let chunk = match runtime.load(format!("return {source}"), "stdin") {
        Ok(chunk) => chunk,
        Err(_) => match runtime.load(source, "stdin") {
            Ok(chunk) => chunk,
            Err(BridgeError::Syntax { message }) if message.ends_with("<eof>") => return Snippet::Incomplete,
            Err(err) => return Snippet::Failed(err),
        },
    };
    let values = match chunk.call([]) {
        Ok(values) => values,
        Err(err) => return Snippet::Failed(err),
    };
    let texts = values
        .iter()
        .map(|value| runtime.tostring(value))
        .collect::<Result<Vec<_>, _>>();
    match texts {
        Ok(texts) => Snippet::Done(texts),
        Err(err) => Snippet::Failed(err),
    }
}

fn report(err: &BridgeError) {
    eprintln!("error: {err}");
    if let Some(traceback) = err.traceback() {
        // the traceback repeats the message on its first line
        let frames = traceback.split_once('\n').map_or(traceback, |(_, rest)| rest);
        eprintln!("{frames}");
    }
}

/// Reads one line from stdin after printing a prompt.
///
/// Returns `None` on EOF (Ctrl+D).
fn read_line(prompt: &str) -> Option<String> {
    print!("{prompt}");
    if io::stdout().flush().is_err() {
        return None;
    }
    let mut input = String::new();
    let read = io::stdin().read_line(&mut input).ok()?;
    if read == 0 {
        return None;
    }
    Some(input.trim_end_matches(['\r', '\n']).to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Options, String> {
        parse_args(args.iter().map(|arg| (*arg).to_owned()))
    }

    #[test]
    fn script_arguments_are_passed_through() {
        let options = parse(&["--trace", "main.lua", "--config", "x"]).unwrap();
        assert!(options.trace);
        assert_eq!(options.config, None);
        assert_eq!(options.script.as_deref(), Some("main.lua"));
        assert_eq!(options.script_args, vec!["--config".to_owned(), "x".to_owned()]);
    }

    #[test]
    fn bad_flags_are_rejected() {
        assert!(parse(&["--config"]).is_err());
        assert!(parse(&["--verbose"]).is_err());
        assert!(parse(&["--trace", "--profile"]).is_err());
    }

    #[test]
    fn snippets_are_tried_as_expressions_first() {
        let runtime = Runtime::new().unwrap();
        install_host_library(&runtime, &["one".to_owned()]).unwrap();
        assert!(matches!(execute_snippet(&runtime, "1 + 1"), Snippet::Done(values) if values == ["2"]));
        assert!(matches!(execute_snippet(&runtime, "x = 5"), Snippet::Done(values) if values.is_empty()));
        assert!(matches!(execute_snippet(&runtime, "x, host.args[0]"), Snippet::Done(values) if values == ["5", "one"]));
        assert!(matches!(execute_snippet(&runtime, "for i = 1, 2 do"), Snippet::Incomplete));
        assert!(matches!(execute_snippet(&runtime, "error('no')"), Snippet::Failed(_)));
        assert!(matches!(execute_snippet(&runtime, "x = = 1"), Snippet::Failed(BridgeError::Syntax { .. })));
    }
}
