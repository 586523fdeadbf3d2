use regex_syntax::ast::parse::ParserBuilder;
use regex_syntax::hir::translate::TranslatorBuilder;

use regex_csa::{CaBuilder, CountingAutomaton, Csa, Error, Matcher};

use std::io::{self, Write};
use std::process;

const USAGE: &str = "\
recsa: match byte strings with a counting automaton

Usage:
  recsa [OPTIONS] dot <pattern>
  recsa [OPTIONS] match <pattern> <input>...

`dot` prints the counting automaton in Graphviz format.  `match` runs every
input through one shared counter-set automaton and exits with status 1
unless all of them match.

Options:
  --chunk-size <N>   Feed each input N bytes at a time
  --debug            Show the live counter sets after every chunk
  -h, --help         Show this text

Logging: RUST_LOG=regex_csa=debug (or =trace) reports construction and
matcher cache activity on stderr.";

/// Print `message` and the usage hint, then exit with status 1.
fn fail(message: &str) -> ! {
    eprintln!("recsa: {message}");
    eprintln!("try `recsa --help`");
    process::exit(1);
}

fn compile(pattern: &str) -> CountingAutomaton {
    let ast = ParserBuilder::new()
        .build()
        .parse(pattern)
        .unwrap_or_else(|e| fail(&format!("cannot parse {pattern:?}: {e}")));
    let hir = TranslatorBuilder::new()
        .unicode(false)
        .utf8(false)
        .dot_matches_new_line(true)
        .build()
        .translate(pattern, &ast)
        .unwrap_or_else(|e| fail(&format!("cannot translate {pattern:?}: {e}")));
    CaBuilder::default()
        .build(&hir)
        .unwrap_or_else(|e| fail(&format!("cannot compile {pattern:?}: {e}")))
}

#[derive(Default)]
struct Options {
    chunk_size: Option<usize>,
    debug: bool,
}

enum Command {
    Dot { pattern: String },
    Match { pattern: String, inputs: Vec<String> },
}

fn parse_args(args: impl IntoIterator<Item = String>) -> (Options, Command) {
    let mut options = Options::default();
    let mut positional: Vec<String> = Vec::new();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                println!("{USAGE}");
                process::exit(0);
            }
            "--debug" => options.debug = true,
            "--chunk-size" => {
                let value = args.next().unwrap_or_else(|| fail("--chunk-size needs a value"));
                options.chunk_size = match value.parse::<usize>() {
                    Ok(n) if n > 0 => Some(n),
                    _ => fail(&format!("--chunk-size expects a positive integer, got {value:?}")),
                };
            }
            flag if flag.starts_with('-') => fail(&format!("unknown option {flag}")),
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let command = match (positional.next().as_deref(), positional.next()) {
        (Some("dot"), Some(pattern)) if positional.len() == 0 => Command::Dot { pattern },
        (Some("dot"), _) => fail("`dot` takes exactly one pattern"),
        (Some("match"), Some(pattern)) if positional.len() > 0 => Command::Match {
            pattern,
            inputs: positional.collect(),
        },
        (Some("match"), _) => fail("`match` takes a pattern and at least one input"),
        (Some(other), _) => fail(&format!("unknown command {other:?}")),
        (None, _) => {
            eprintln!("{USAGE}");
            process::exit(1);
        }
    };
    (options, command)
}

fn run_dot(pattern: &str) -> io::Result<()> {
    let ca = compile(pattern);
    let mut out = io::stdout().lock();
    ca.to_dot(&mut out)?;
    out.flush()
}

fn counter_sets(matcher: &Matcher<'_>) -> String {
    if matcher.is_dead() {
        return "dead".to_string();
    }
    let sets: Vec<String> = matcher.counter_sets().iter().map(ToString::to_string).collect();
    format!("{} live: {}", sets.len(), sets.join(" "))
}

/// Run one input, chunk by chunk.
fn run_input(csa: &mut Csa, input: &[u8], options: &Options) -> Result<bool, Error> {
    let mut matcher = csa.matcher();
    let chunk_size = options.chunk_size.unwrap_or(input.len()).max(1);
    if options.debug {
        eprintln!("    start        {}", counter_sets(&matcher));
    }
    let mut consumed = 0;
    for chunk in input.chunks(chunk_size) {
        matcher.chunk(chunk)?;
        consumed += chunk.len();
        if options.debug {
            eprintln!("    @{consumed:<10}  {}", counter_sets(&matcher));
        }
    }
    Ok(matcher.finish())
}

fn run_match(pattern: &str, inputs: &[String], options: &Options) -> bool {
    let ca = compile(pattern);
    eprintln!(
        "{pattern}: {} states, {} counting loops, {} symbol classes, {} bytes",
        ca.states().len(),
        ca.loops().len(),
        ca.classes().len(),
        ca.memory_size()
    );

    let mut csa = Csa::new(ca);
    let mut all_matched = true;
    for input in inputs {
        if options.debug {
            eprintln!("  {input:?}");
        }
        let matched = run_input(&mut csa, input.as_bytes(), options)
            .unwrap_or_else(|e| fail(&format!("matching {input:?} failed: {e}")));
        let verdict = if matched { "\x1b[32mMATCH\x1b[0m   " } else { "\x1b[31mNO MATCH\x1b[0m" };
        println!("  {verdict}  {input:?}");
        all_matched &= matched;
    }
    if options.debug {
        eprintln!("{} configurations cached", csa.cached_configs());
    }
    all_matched
}

fn main() {
    env_logger::init();

    let (options, command) = parse_args(std::env::args().skip(1));
    match command {
        Command::Dot { pattern } => {
            if let Err(e) = run_dot(&pattern) {
                fail(&format!("cannot write DOT output: {e}"));
            }
        }
        Command::Match { pattern, inputs } => {
            if !run_match(&pattern, &inputs, &options) {
                process::exit(1);
            }
        }
    }
}
