// Lunar CLI - Command Line Interface
// Usage: lunar [FILE] [OPTIONS]

use clap::Parser;
use colored::*;
use std::fs;
use std::path::{Path, PathBuf};

use lunar_core::ast::{Block, Expr, FunctionBody, Stmt, TableField};
use lunar_core::lexer::Scanner;
use lunar_core::parser::parse_chunk;
use lunar_core::{LuaError, LuaVersion, Script, ScriptOptions, Value};

/// Lunar - An embeddable Lua 5.1-5.5 interpreter
#[derive(Parser)]
#[command(name = "lunar")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "An embeddable Lua 5.1-5.5 interpreter", long_about = None)]
struct Cli {
    /// Lua source file to run
    file: Option<PathBuf>,

    /// Execute inline code
    #[arg(short = 'e', long = "exec")]
    exec: Option<String>,

    /// Check for errors without running
    #[arg(long = "check")]
    check: bool,

    /// Language dialect: 5.1, 5.2, 5.3, 5.4, 5.5 or latest
    #[arg(short = 'l', long = "lua-version")]
    lua_version: Option<String>,

    /// Debug options: tokens, ast, asm (comma-separated)
    #[arg(short = 'd', long = "debug", value_delimiter = ',')]
    debug: Option<Vec<String>>,

    /// Script options as a JSON file
    #[arg(long = "options")]
    options: Option<PathBuf>,

    /// Log interpreter internals to stderr
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let _guard = if cli.verbose {
        match ftlog::Builder::new().max_log_level(log::LevelFilter::Debug).try_init() {
            Ok(guard) => Some(guard),
            Err(e) => {
                eprintln!("{} cannot install logger: {}", "!".yellow(), e);
                None
            }
        }
    } else {
        None
    };

    let debug = DebugFlags::from_options(&cli.debug);

    let result = load_options(&cli).and_then(|options| {
        if let Some(code) = &cli.exec {
            handle_source(code, "<exec>", options, debug, cli.check)
        } else if let Some(path) = &cli.file {
            let source = read_source(path)?;
            handle_source(&source, &path.to_string_lossy(), options, debug, cli.check)
        } else {
            repl(options)
        }
    });

    if let Err(e) = result {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

fn load_options(cli: &Cli) -> Result<ScriptOptions, String> {
    let mut options = match &cli.options {
        Some(path) => ScriptOptions::from_json(&read_source(path)?).map_err(|e| e.format())?,
        None => ScriptOptions::default(),
    };
    if let Some(text) = &cli.lua_version {
        options.compatibility = LuaVersion::parse(text)
            .ok_or_else(|| format!("{} Unknown Lua version: {}", "!".red(), text))?;
    }
    Ok(options)
}

fn read_source(path: &Path) -> Result<String, String> {
    fs::read_to_string(path).map_err(|e| format!("Error reading file '{}': {}", path.display(), e))
}

#[derive(Default, Clone, Copy)]
struct DebugFlags {
    tokens: bool,
    ast: bool,
    asm: bool,
}

impl DebugFlags {
    fn from_options(opts: &Option<Vec<String>>) -> Self {
        let mut flags = Self::default();
        if let Some(opts) = opts {
            for opt in opts {
                match opt.as_str() {
                    "tokens" => flags.tokens = true,
                    "ast" => flags.ast = true,
                    "asm" => flags.asm = true,
                    _ => eprintln!("{} Unknown debug option: {}", "!".yellow(), opt),
                }
            }
        }
        flags
    }
}

fn handle_source(
    source: &str,
    chunk_name: &str,
    options: ScriptOptions,
    debug: DebugFlags,
    check: bool,
) -> Result<(), String> {
    let script = Script::new(options);
    let profile = script.profile();

    if debug.tokens {
        let tokens = Scanner::new(source, chunk_name)
            .with_goto_keyword(profile.goto_statement)
            .scan_tokens()
            .map_err(|e| e.format())?;
        println!("{}", "-- Tokens --".cyan());
        for token in &tokens {
            println!("  {:?} '{}'", token.kind, token.lexeme);
        }
        println!();
        return Ok(());
    }

    if debug.ast {
        let chunk = parse_chunk(source, chunk_name, profile).map_err(|e| e.format())?;
        let mut tree = ptree::TreeBuilder::new(format!("Chunk '{}'", chunk.name));
        build_block_tree(&mut tree, &chunk.main.body);
        ptree::print_tree(&tree.build()).map_err(|e| e.to_string())?;
        return Ok(());
    }

    let function = script.load_string(source, Some(chunk_name)).map_err(|e| e.format())?;

    if debug.asm {
        println!("{}", format!("== {} ==", chunk_name).cyan());
        println!("{}", script.disassemble());
    }
    if check {
        println!("{} No errors found in {}", "✓".green(), chunk_name);
        return Ok(());
    }
    if debug.asm {
        return Ok(());
    }

    script.call(&function, Vec::new()).map_err(|e| e.format())?;
    Ok(())
}

fn repl(options: ScriptOptions) -> Result<(), String> {
    use reedline::{
        FileBackedHistory, Prompt, PromptHistorySearch, PromptHistorySearchStatus, Reedline, Signal,
    };
    use std::borrow::Cow;
    use std::io::Write;

    struct ReplPrompt {
        left: &'static str,
    }

    impl Prompt for ReplPrompt {
        fn render_prompt_left(&self) -> Cow<'_, str> {
            Cow::Borrowed(self.left)
        }
        fn render_prompt_right(&self) -> Cow<'_, str> {
            Cow::Borrowed("")
        }
        fn render_prompt_indicator(&self, _: reedline::PromptEditMode) -> Cow<'_, str> {
            Cow::Borrowed("")
        }
        fn render_prompt_multiline_indicator(&self) -> Cow<'_, str> {
            Cow::Borrowed(">> ")
        }
        fn render_prompt_history_search_indicator(&self, history_search: PromptHistorySearch) -> Cow<'_, str> {
            let prefix = match history_search.status {
                PromptHistorySearchStatus::Passing => "",
                PromptHistorySearchStatus::Failing => "failing ",
            };
            Cow::Owned(format!("({}reverse-search: {}) ", prefix, history_search.term))
        }
    }

    let mut script = Script::new(options.clone());

    println!();
    println!(
        "  {}  {}",
        "Lunar".cyan().bold(),
        format!("v{} ({})", env!("CARGO_PKG_VERSION"), script.profile().display_name()).bright_black()
    );
    println!("  {}", "Type .help for commands, .exit to quit".bright_black());
    println!();

    let history_path = home_dir().join(".lunar_history");
    let history = Box::new(FileBackedHistory::with_file(1000, history_path).map_err(|e| e.to_string())?);
    let mut line_editor = Reedline::create().with_history(history);
    let main_prompt = ReplPrompt { left: "> " };
    let continue_prompt = ReplPrompt { left: ">> " };
    let mut accumulated_input = String::new();

    loop {
        let prompt = if accumulated_input.is_empty() {
            &main_prompt
        } else {
            &continue_prompt
        };

        match line_editor.read_line(prompt) {
            Ok(Signal::Success(line)) => {
                let input = line.trim();
                if accumulated_input.is_empty() && input.is_empty() {
                    continue;
                }

                if accumulated_input.is_empty() && input.starts_with('.') {
                    match input {
                        ".exit" | ".quit" => break,
                        ".help" => {
                            print_repl_help();
                            continue;
                        }
                        ".clear" => {
                            print!("\x1B[2J\x1B[1;1H");
                            let _ = std::io::stdout().flush();
                            continue;
                        }
                        ".reset" => {
                            script = Script::new(options.clone());
                            println!("{}", "  Script state reset".bright_black());
                            continue;
                        }
                        _ => {
                            println!("{} Unknown command: {}", "!".red(), input);
                            println!("  Type {} for available commands", ".help".cyan());
                            continue;
                        }
                    }
                }

                if !accumulated_input.is_empty() {
                    accumulated_input.push('\n');
                }
                accumulated_input.push_str(&line);

                let code = match accumulated_input.trim().strip_prefix('=') {
                    Some(expr) => format!("return {}", expr),
                    None => accumulated_input.clone(),
                };
                match run_repl_line(&script, &code) {
                    Ok(value) => print_repl_result(&value),
                    Err(e) if e.premature_eof => continue,
                    Err(e) => eprintln!("{}", e.format()),
                }
                accumulated_input.clear();
            }
            Ok(Signal::CtrlC) => {
                if !accumulated_input.is_empty() {
                    accumulated_input.clear();
                    println!("{}", "^C (input cleared)".bright_black());
                } else {
                    println!("{}", "^C".bright_black());
                }
            }
            Ok(Signal::CtrlD) => {
                println!("{}", "^D".bright_black());
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}

/// Tries the line as an expression first so `1 + 1` prints its value
fn run_repl_line(script: &Script, code: &str) -> Result<Value, LuaError> {
    let function = match script.load_string(&format!("return {}", code), Some("stdin")) {
        Ok(function) => function,
        Err(_) => script.load_string(code, Some("stdin"))?,
    };
    script.call(&function, Vec::new())
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

fn print_repl_help() {
    println!();
    println!("  {}", "REPL Commands:".cyan().bold());
    println!("    {}    Exit the REPL", ".exit".yellow());
    println!("    {}    Clear the screen", ".clear".yellow());
    println!("    {}    Reset script state", ".reset".yellow());
    println!("    {}    Show this help", ".help".yellow());
    println!();
    println!("  {}", "Input:".cyan().bold());
    println!("    {}    Print the value of expr", "=expr".yellow());
    println!("    Incomplete statements continue on the next line");
    println!();
}

fn print_repl_result(value: &Value) {
    let items: Vec<String> = value.tuple_values().iter().map(format_value).collect();
    if !items.is_empty() {
        println!("{}", items.join("\t"));
    }
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Nil | Value::Void => "nil".bright_black().to_string(),
        Value::Boolean(_) | Value::Number(_) => value.to_display_string().yellow().to_string(),
        Value::String(_) => format!("{:?}", value.to_display_string()).green().to_string(),
        Value::Function(_) | Value::ClrFunction(_) => value.to_display_string().cyan().to_string(),
        _ => value.to_display_string().magenta().to_string(),
    }
}

// ==================== AST tree ====================

fn build_block_tree(tree: &mut ptree::TreeBuilder, block: &Block) {
    for stmt in &block.statements {
        build_stmt_tree(tree, stmt);
    }
}

fn build_function_tree(tree: &mut ptree::TreeBuilder, label: &str, body: &FunctionBody) {
    let mut params: Vec<String> = body.params.iter().map(|p| p.name.to_string()).collect();
    if body.varargs.is_some() {
        params.push("...".to_string());
    }
    tree.begin_child(format!("{} '{}' ({})", label, body.name, params.join(", ")));
    build_block_tree(tree, &body.body);
    tree.end_child();
}

fn build_stmt_tree(tree: &mut ptree::TreeBuilder, stmt: &Stmt) {
    match stmt {
        Stmt::Local { targets, values, .. } => {
            let names: Vec<&str> = targets.iter().map(|t| &*t.name).collect();
            tree.begin_child(format!("Local {}", names.join(", ")));
            for value in values {
                build_expr_tree(tree, value);
            }
            tree.end_child();
        }
        Stmt::LocalFunction { body, .. } => build_function_tree(tree, "LocalFunction", body),
        Stmt::Function { target, body, .. } => {
            tree.begin_child("Function".to_string());
            build_expr_tree(tree, target);
            build_function_tree(tree, "body", body);
            tree.end_child();
        }
        Stmt::Assign { targets, values, .. } => {
            tree.begin_child("Assign".to_string());
            tree.begin_child("targets".to_string());
            for target in targets {
                build_expr_tree(tree, target);
            }
            tree.end_child();
            tree.begin_child("values".to_string());
            for value in values {
                build_expr_tree(tree, value);
            }
            tree.end_child();
            tree.end_child();
        }
        Stmt::Call { call, .. } => build_expr_tree(tree, call),
        Stmt::Do { block, .. } => {
            tree.begin_child("Do".to_string());
            build_block_tree(tree, block);
            tree.end_child();
        }
        Stmt::While { condition, body, .. } => {
            tree.begin_child("While".to_string());
            tree.begin_child("condition".to_string());
            build_expr_tree(tree, condition);
            tree.end_child();
            tree.begin_child("body".to_string());
            build_block_tree(tree, body);
            tree.end_child();
            tree.end_child();
        }
        Stmt::Repeat { body, condition, .. } => {
            tree.begin_child("Repeat".to_string());
            tree.begin_child("body".to_string());
            build_block_tree(tree, body);
            tree.end_child();
            tree.begin_child("until".to_string());
            build_expr_tree(tree, condition);
            tree.end_child();
            tree.end_child();
        }
        Stmt::If { clauses, else_block, .. } => {
            tree.begin_child("If".to_string());
            for (condition, block) in clauses {
                tree.begin_child("condition".to_string());
                build_expr_tree(tree, condition);
                tree.end_child();
                tree.begin_child("then".to_string());
                build_block_tree(tree, block);
                tree.end_child();
            }
            if let Some(block) = else_block {
                tree.begin_child("else".to_string());
                build_block_tree(tree, block);
                tree.end_child();
            }
            tree.end_child();
        }
        Stmt::NumericFor { variable, start, limit, step, body, .. } => {
            tree.begin_child(format!("NumericFor '{}'", variable.name));
            build_expr_tree(tree, start);
            build_expr_tree(tree, limit);
            if let Some(step) = step {
                build_expr_tree(tree, step);
            }
            tree.begin_child("body".to_string());
            build_block_tree(tree, body);
            tree.end_child();
            tree.end_child();
        }
        Stmt::GenericFor { variables, exprs, body, .. } => {
            let names: Vec<&str> = variables.iter().map(|v| &*v.name).collect();
            tree.begin_child(format!("GenericFor {}", names.join(", ")));
            for expr in exprs {
                build_expr_tree(tree, expr);
            }
            tree.begin_child("body".to_string());
            build_block_tree(tree, body);
            tree.end_child();
            tree.end_child();
        }
        Stmt::Return { values, .. } => {
            tree.begin_child("Return".to_string());
            for value in values {
                build_expr_tree(tree, value);
            }
            tree.end_child();
        }
        Stmt::Break { .. } => {
            tree.add_empty_child("Break".to_string());
        }
        Stmt::Goto { label, .. } => {
            tree.add_empty_child(format!("Goto '{}'", label));
        }
        Stmt::Label { name, .. } => {
            tree.add_empty_child(format!("Label '{}'", name));
        }
    }
}

fn build_expr_tree(tree: &mut ptree::TreeBuilder, expr: &Expr) {
    match expr {
        Expr::Nil { .. } => {
            tree.add_empty_child("nil".to_string());
        }
        Expr::Boolean { value, .. } => {
            tree.add_empty_child(value.to_string());
        }
        Expr::Integer { value, .. } => {
            tree.add_empty_child(value.to_string());
        }
        Expr::Float { value, .. } => {
            tree.add_empty_child(format!("{:?}", value));
        }
        Expr::String { value, .. } => {
            tree.add_empty_child(format!("{:?}", String::from_utf8_lossy(value)));
        }
        Expr::Varargs { .. } => {
            tree.add_empty_child("...".to_string());
        }
        Expr::Symbol { symbol, .. } => {
            tree.add_empty_child(format!("{:?} '{}'", symbol.kind, symbol.name));
        }
        Expr::Index { object, key, .. } => {
            tree.begin_child("Index".to_string());
            build_expr_tree(tree, object);
            build_expr_tree(tree, key);
            tree.end_child();
        }
        Expr::Call { callee, args, .. } => {
            tree.begin_child("Call".to_string());
            build_expr_tree(tree, callee);
            for arg in args {
                build_expr_tree(tree, arg);
            }
            tree.end_child();
        }
        Expr::MethodCall { object, method, args, .. } => {
            tree.begin_child(format!("MethodCall ':{}'", method));
            build_expr_tree(tree, object);
            for arg in args {
                build_expr_tree(tree, arg);
            }
            tree.end_child();
        }
        Expr::Function { body, .. } => build_function_tree(tree, "Function", body),
        Expr::Binary { left, op, right, .. } => {
            tree.begin_child(format!("Binary '{}'", op.symbol()));
            build_expr_tree(tree, left);
            build_expr_tree(tree, right);
            tree.end_child();
        }
        Expr::Unary { op, operand, .. } => {
            tree.begin_child(format!("Unary '{}'", op.symbol()));
            build_expr_tree(tree, operand);
            tree.end_child();
        }
        Expr::Paren { expr, .. } => {
            tree.begin_child("Paren".to_string());
            build_expr_tree(tree, expr);
            tree.end_child();
        }
        Expr::Table { fields, .. } => {
            tree.begin_child("Table".to_string());
            for field in fields {
                match field {
                    TableField::Positional(value) => build_expr_tree(tree, value),
                    TableField::Keyed { key, value } => {
                        tree.begin_child("field".to_string());
                        build_expr_tree(tree, key);
                        build_expr_tree(tree, value);
                        tree.end_child();
                    }
                }
            }
            tree.end_child();
        }
    }
}
