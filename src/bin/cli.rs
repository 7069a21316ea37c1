#![cfg(not(tarpaulin_include))]

use sheetsync::cache::HistoryCache;
use sheetsync::config::SyncConfig;
use sheetsync::reconciler::Renderer;
use sheetsync::scheduler::HistorySource;
use sheetsync::transport::HttpBackend;
use sheetsync::{CellRef, Document, SyncEvent, SyncScheduler};

use std::env;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};

const VIEW_ROWS: usize = 10;
const VIEW_COLS: usize = 10;

/// Top-left corner of the visible part of the table.
#[derive(Clone, Copy, Default)]
struct Viewport {
    row: usize,
    col: usize,
}

/// Redraws the table whenever a remote change is applied.
struct TableView {
    viewport: Arc<Mutex<Viewport>>,
}

impl Renderer for TableView {
    fn render(&mut self, document: &Document) {
        let viewport = self.viewport.lock().map(|v| *v).unwrap_or_default();
        println!();
        display(document, viewport);
    }
}

fn display(document: &Document, viewport: Viewport) {
    let end_row = (viewport.row + VIEW_ROWS).min(document.row_count());
    let end_col = (viewport.col + VIEW_COLS).min(document.col_count());

    print!("\t");
    for col in viewport.col..end_col {
        let kind = document.schema().kind(col).unwrap_or_default();
        print!("{:<20}", format!("{} ({})", CellRef::col_to_letter(col), kind));
    }
    println!();
    for row in viewport.row..end_row {
        print!("{}\t", row + 1);
        for col in viewport.col..end_col {
            let kind = document.schema().kind(col).unwrap_or_default();
            let value = document.get(CellRef::new(row, col)).unwrap_or_default();
            print!("{:<20}", kind.display(value));
        }
        println!();
    }
}

fn prompt(status: &str) {
    print!("({}) > ", status);
    let _ = io::stdout().flush();
}

fn help() {
    println!("Commands:");
    println!("  <cell>=<value>: Set a cell, e.g. A1=x@y.com");
    println!("  +<n>: Append n empty rows");
    println!("  UNDO / REDO: Step through local history");
    println!("  w/a/s/d: Scroll the view");
    println!("  issues: List cells failing their column check");
    println!("  retry: Resend unsaved edits after a failed save");
    println!("  q: Save pending edits and quit");
}

/// Applies one command line. Returns false when the user wants to quit.
fn handle(line: &str, scheduler: &mut SyncScheduler, viewport: &Arc<Mutex<Viewport>>, status: &mut String) -> bool {
    *status = String::from("ok");
    let Ok(mut view) = viewport.lock() else {
        return false;
    };
    match line {
        "q" => return false,
        "help" => help(),
        "UNDO" => {
            if scheduler.undo().is_err() {
                *status = String::from("nothing to undo");
            }
        }
        "REDO" => {
            if scheduler.redo().is_err() {
                *status = String::from("nothing to redo");
            }
        }
        "retry" => scheduler.retry_save(),
        "issues" => {
            for issue in scheduler.document().issues() {
                println!("  {}: {}", issue.cell, issue.reason);
            }
        }
        "w" => view.row = view.row.saturating_sub(VIEW_ROWS),
        "s" => {
            if view.row + VIEW_ROWS < scheduler.document().row_count() {
                view.row += VIEW_ROWS;
            }
        }
        "a" => view.col = view.col.saturating_sub(VIEW_COLS),
        "d" => {
            if view.col + VIEW_COLS < scheduler.document().col_count() {
                view.col += VIEW_COLS;
            }
        }
        _ if line.starts_with('+') => match line[1..].trim().parse::<usize>() {
            Ok(count) => {
                scheduler.append_rows(count);
            }
            Err(_) => *status = String::from("invalid row count"),
        },
        _ => match line.split_once('=') {
            Some((cell, value)) => match cell.trim().parse::<CellRef>() {
                Ok(cell) => {
                    if let Err(e) = scheduler.apply_local_edit(cell, value) {
                        *status = e.to_string();
                    }
                }
                Err(e) => *status = e.to_string(),
            },
            None => *status = String::from("invalid command"),
        },
    }
    let view = *view;
    display(scheduler.document(), view);
    true
}

fn report(event: SyncEvent, status: &mut String) {
    match event {
        SyncEvent::Saved { cursor } => log::debug!("saved at {}", cursor),
        SyncEvent::RemoteChange { editor, .. } => {
            *status = format!("updated by {}", editor.as_deref().unwrap_or("someone"));
        }
        SyncEvent::SaveFailed(err) => {
            eprintln!("\nsave failed: {} (type 'retry' to resend)", err);
            *status = String::from("unsaved");
        }
        SyncEvent::Suspended(err) => {
            eprintln!("\nsync stopped: {}", err);
            *status = String::from("offline");
        }
        SyncEvent::Rejected(err) => *status = err.to_string(),
        SyncEvent::ModeChanged(mode) => log::debug!("sync mode {:?}", mode),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 4 {
        eprintln!("Usage: {} <server-url> <document-id> <token>", args[0]);
        return Ok(());
    }

    let config = match env::var("SHEETSYNC_CONFIG") {
        Ok(path) => SyncConfig::from_json_file(path)?,
        Err(_) => SyncConfig::from_env()?,
    };
    let history = match env::var("SHEETSYNC_HISTORY_DIR") {
        Ok(dir) => HistorySource::Disk(dir.into()),
        Err(_) => HistorySource::Cache(HistoryCache::new(
            config.history_cache_documents,
            config.history_cache_entries,
        )),
    };
    let backend = Arc::new(HttpBackend::new(&args[1], &args[3]));
    let mut scheduler = SyncScheduler::connect(config, backend, &args[2])
        .await?
        .with_history(history);

    let viewport = Arc::new(Mutex::new(Viewport::default()));
    scheduler.set_renderer(Box::new(TableView {
        viewport: viewport.clone(),
    }));
    let mut events = scheduler.subscribe();

    let mut status = String::from("ok");
    display(scheduler.document(), Viewport::default());
    prompt(&status);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if !line.is_empty() && !handle(line, &mut scheduler, &viewport, &mut status) {
                    break;
                }
                prompt(&status);
            }
            Some(event) = events.recv() => {
                report(event, &mut status);
                prompt(&status);
            }
            _ = scheduler.tick() => {}
        }
    }

    if scheduler.store().is_dirty() {
        match scheduler.flush().await {
            Ok(cursor) => log::info!("saved at {}", cursor),
            Err(e) => eprintln!("unsaved edits were lost: {}", e),
        }
    }
    Ok(())
}
