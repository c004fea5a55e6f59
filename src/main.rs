use std::{env, io::Write, process::ExitCode};

use kouch::{
    EngineConfig, Handle, PageIndex, Transaction, art::welcome_message, types::error::DatabaseError,
};
use rustyline::{DefaultEditor, error::ReadlineError};
use tracing_subscriber::EnvFilter;

const HISTORY_FILE: &str = ".kouch_history";

struct Shell {
    handle: Handle,
    txn: Option<Transaction>,
}

fn require_txn(txn: &Option<Transaction>) -> Result<&Transaction, String> {
    txn.as_ref()
        .ok_or_else(|| "no open transaction, run 'begin' first".to_string())
}

impl Shell {
    fn execute(&mut self, cmd: &str, args: &[&str]) -> Result<String, String> {
        match cmd {
            "begin" => {
                let txn = self.handle.begin().map_err(describe)?;
                let message = format!("transaction {} started", txn.id());
                self.txn = Some(txn);
                Ok(message)
            }
            "put" => {
                let page_index = parse_page_index(args.first())?;
                let byte = parse_byte(args.get(1))?;
                let page_size = self.handle.page_size().map_err(describe)?;
                let txn = require_txn(&self.txn)?;
                self.handle
                    .put(txn, page_index, &vec![byte; page_size])
                    .map_err(describe)?;
                Ok(format!("staged page {} filled with 0x{:02X}", page_index, byte))
            }
            "read" => {
                let page_index = parse_page_index(args.first())?;
                let data = match &self.txn {
                    Some(txn) => self.handle.read_in(txn, page_index),
                    None => self.handle.read(page_index),
                }
                .map_err(describe)?;
                Ok(summarize_page(page_index, &data))
            }
            "alloc" => {
                let txn = require_txn(&self.txn)?;
                let page_index = self.handle.allocate(txn).map_err(describe)?;
                Ok(format!("allocated page {}", page_index))
            }
            "free" => {
                let page_index = parse_page_index(args.first())?;
                let txn = require_txn(&self.txn)?;
                self.handle.free(txn, page_index).map_err(describe)?;
                Ok(format!("freed page {}", page_index))
            }
            "commit" => {
                let txn = self.txn.take().ok_or("no open transaction")?;
                let info = self.handle.commit(txn).map_err(describe)?;
                Ok(format!(
                    "transaction {} committed ({} pages logged)",
                    info.txn_id, info.pages_logged
                ))
            }
            "abort" => {
                let txn = self.txn.take().ok_or("no open transaction")?;
                let txn_id = txn.id();
                self.handle.abort(txn).map_err(describe)?;
                Ok(format!("transaction {} aborted", txn_id))
            }
            "checkpoint" => {
                let stats = self.handle.checkpoint().map_err(describe)?;
                Ok(format!(
                    "checkpoint wrote {} pages, truncated {} WAL bytes",
                    stats.pages_written, stats.wal_bytes_truncated
                ))
            }
            "vacuum" => {
                let released = self.handle.vacuum().map_err(describe)?;
                Ok(format!("released {} trailing pages", released))
            }
            "stat" => {
                let stat = self.handle.stat().map_err(describe)?;
                Ok(format!(
                    "path:           {}\nformat version: {}\npage size:      {}\npages:          {} ({} free)\nfile size:      {} bytes\nwal size:       {} bytes\nupdate seq:     {}\ncreated at:     {}",
                    stat.path.display(),
                    stat.format_version,
                    stat.page_size,
                    stat.page_count,
                    stat.free_pages,
                    stat.file_size,
                    stat.wal_size,
                    stat.update_seq,
                    stat.created_at
                        .map(|at| at.to_rfc3339())
                        .unwrap_or_else(|| "unknown".to_string()),
                ))
            }
            "version" => self.handle.format_version().map_err(describe),
            _ => Err(format!("unknown command '{}', try 'help'", cmd)),
        }
    }
}

fn describe(err: DatabaseError) -> String {
    err.to_string()
}

fn parse_page_index(arg: Option<&&str>) -> Result<PageIndex, String> {
    let raw = arg.ok_or("missing page index")?;
    raw.parse::<PageIndex>()
        .map_err(|_| format!("invalid page index '{}'", raw))
}

fn parse_byte(arg: Option<&&str>) -> Result<u8, String> {
    let raw = arg.ok_or("missing fill byte")?;
    let digits = raw.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(digits, 16).map_err(|_| format!("invalid hex byte '{}'", raw))
}

fn summarize_page(page_index: PageIndex, data: &[u8]) -> String {
    let preview: Vec<String> = data.iter().take(16).map(|b| format!("{:02X}", b)).collect();
    let uniform = data.iter().all(|&b| b == data[0]);
    format!(
        "page {} ({} bytes{}): {} ...",
        page_index,
        data.len(),
        if uniform { ", uniform" } else { "" },
        preview.join(" ")
    )
}

fn process_command(command: &str, shell: &mut Shell) -> bool {
    let cmd = command.trim();
    let mut parts = cmd.split_whitespace();
    let Some(head) = parts.next() else {
        return true;
    };
    let args: Vec<&str> = parts.collect();

    match head.to_lowercase().as_str() {
        "exit" | "quit" | "q" => {
            println!("Goodbye!");
            return false;
        }
        "help" | "h" => {
            println!(
                r#"
Available commands:
  begin               - Start a transaction
  put <page> <byte>   - Stage a page filled with a hex byte
  read <page>         - Show a page (inside the open transaction, if any)
  alloc               - Allocate a page in the open transaction
  free <page>         - Free a page in the open transaction
  commit, abort       - Finish the open transaction
  checkpoint          - Apply the WAL to the database file
  vacuum              - Release free pages at the end of the file
  stat, version       - Show database information
  clear               - Clear the screen
  exit, quit, q       - Close the database and exit

Use Up/Down arrows to navigate command history.
"#
            );
        }
        "clear" => {
            print!("\x1B[2J\x1B[1;1H");
            let _ = std::io::stdout().flush();
        }
        other => match shell.execute(other, &args) {
            Ok(output) => println!("{}", output),
            Err(message) => println!("Error: {}", message),
        },
    }

    true
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("KOUCH_LOG"))
        .init();

    let mut args = env::args().skip(1);
    let Some(path) = args.next() else {
        eprintln!("usage: kouch <database-file> [config.json]");
        return ExitCode::FAILURE;
    };
    let config = match args.next() {
        Some(config_path) => match EngineConfig::from_json_file(&config_path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("Failed to load {}: {}", config_path, err);
                return ExitCode::FAILURE;
            }
        },
        None => EngineConfig::default(),
    };

    let handle = match Handle::open_with_config(&path, &config) {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("Failed to open database: {}", err);
            return ExitCode::FAILURE;
        }
    };
    println!("{}", welcome_message("KOUCH DB"));

    let mut shell = Shell { handle, txn: None };
    if let Err(err) = run_repl(&mut shell) {
        eprintln!("Error: {:?}", err);
    }

    if let Some(txn) = shell.txn.take() {
        println!("Aborting open transaction {}", txn.id());
    }
    match shell.handle.close() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Failed to close database: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn run_repl(shell: &mut Shell) -> rustyline::Result<()> {
    let mut rl = DefaultEditor::new()?;
    let _ = rl.load_history(HISTORY_FILE);

    loop {
        let prompt = match &shell.txn {
            Some(txn) => format!("kouch[txn {}]> ", txn.id()),
            None => "kouch> ".to_string(),
        };
        match rl.readline(&prompt) {
            Ok(line) => {
                let command = line.trim().to_string();
                if !command.is_empty() {
                    rl.add_history_entry(&command)?;
                    if !process_command(&command, shell) {
                        break;
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("Interrupted");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("EOF");
                break;
            }
            Err(err) => return Err(err),
        }
    }

    let _ = rl.save_history(HISTORY_FILE);
    Ok(())
}
