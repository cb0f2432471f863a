//! Terminal todo list driving the collection engine end-to-end.
//!
//! Each todo item is a running component instance: `pluck` renders the list
//! whenever any item's state changes, `merge` feeds the activity log, and
//! removing an item goes through its own removal channel.

use std::fs;
use std::path::PathBuf;

use futures::StreamExt;
use futures_signals::signal::Mutable;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};

use troupe::{BoxError, Collection, ItemContext, Outlet, Relay, relay, spawn};

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TodoConfig {
    prompt: String,
    initial: Vec<String>,
}

impl Default for TodoConfig {
    fn default() -> Self {
        Self {
            prompt: "todo>".to_string(),
            initial: Vec::new(),
        }
    }
}

fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("troupe-todolist.toml"))
}

fn load_config() -> TodoConfig {
    let Some(path) = config_path() else {
        return TodoConfig::default();
    };
    match fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("warning: failed to parse {}: {e}", path.display());
                TodoConfig::default()
            }
        },
        Err(_) => TodoConfig::default(),
    }
}

#[derive(Clone, Debug)]
struct TodoState {
    title: String,
    done: bool,
}

#[derive(Clone, Debug)]
enum TodoEvent {
    Completed(String),
    Reopened(String),
}

struct TodoOutputs {
    state: Mutable<TodoState>,
    events: Outlet<TodoEvent>,
    removed: Outlet<()>,
}

impl TodoOutputs {
    fn toggle(&self) {
        let event = {
            let mut state = self.state.lock_mut();
            state.done = !state.done;
            if state.done {
                TodoEvent::Completed(state.title.clone())
            } else {
                TodoEvent::Reopened(state.title.clone())
            }
        };
        self.events.emit(event);
    }
}

fn todo_item(_ctx: ItemContext<()>, title: String) -> Result<TodoOutputs, BoxError> {
    Ok(TodoOutputs {
        state: Mutable::new(TodoState { title, done: false }),
        events: Outlet::new(),
        removed: Outlet::new(),
    })
}

fn render(states: &[TodoState]) {
    println!("--- {} item(s) ---", states.len());
    for (index, state) in states.iter().enumerate() {
        let mark = if state.done { "x" } else { " " };
        println!("{index}: [{mark}] {}", state.title);
    }
}

fn with_item(todos: &Collection<TodoOutputs>, index: &str, action: impl Fn(&TodoOutputs)) {
    let Ok(index) = index.trim().parse::<usize>() else {
        println!("expected an item index");
        return;
    };
    let snapshot = todos.current();
    match snapshot.as_slice().get(index) {
        Some(instance) => action(instance.outputs()),
        None => println!("no item at index {index}"),
    }
}

/// Returns false when the user asked to quit.
fn handle_command(line: &str, todos: &Collection<TodoOutputs>, add_todo: &Relay<String>) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return true;
    }
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "add" if !rest.trim().is_empty() => add_todo.send(rest.trim().to_string()),
        "done" => with_item(todos, rest, TodoOutputs::toggle),
        "rm" => with_item(todos, rest, |outputs| outputs.removed.emit(())),
        "quit" | "exit" => return false,
        _ => println!("commands: add <title> | done <index> | rm <index> | quit"),
    }
    true
}

#[tokio::main]
async fn main() {
    let config = load_config();

    let (add_todo, add_stream) = relay::<String>();
    let todos = Collection::new(todo_item, (), add_stream, |outputs: &TodoOutputs| {
        outputs.removed.subscribe()
    });

    let rendered = todos.pluck(|item| item.outputs().state.signal_cloned());
    let _renderer = spawn(rendered.for_each(|states| {
        render(&states);
        async {}
    }));

    let activity = todos.merge(|item| item.outputs().events.subscribe());
    let _logger = spawn(activity.for_each(|event| {
        match event.value {
            TodoEvent::Completed(title) => println!("  {} completed: {title}", event.id),
            TodoEvent::Reopened(title) => println!("  {} reopened: {title}", event.id),
        }
        async {}
    }));

    for title in &config.initial {
        handle_command(&format!("add {title}"), &todos, &add_todo);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        println!("{}", config.prompt);
        match lines.next_line().await {
            Ok(Some(line)) => {
                if !handle_command(&line, &todos, &add_todo) {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                eprintln!("stdin error: {e}");
                break;
            }
        }
    }
}
