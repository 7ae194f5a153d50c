use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

/// A line typed into the `run` console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
  Flush,
  Status,
  /// Install another cache version, e.g. `update v2`
  Update(String),
  /// Answer to an update prompt
  Answer(bool),
  Quit,
  Unknown(String),
}

impl Input {
  pub fn parse(line: &str) -> Option<Self> {
    match line.trim() {
      "" => None,
      "f" | "flush" => Some(Input::Flush),
      "s" | "status" => Some(Input::Status),
      "y" | "yes" => Some(Input::Answer(true)),
      "n" | "no" => Some(Input::Answer(false)),
      "q" | "quit" | "exit" => Some(Input::Quit),
      other => match other.split_once(char::is_whitespace) {
        Some(("update", version)) if !version.trim().is_empty() => {
          Some(Input::Update(version.trim().to_string()))
        }
        _ => Some(Input::Unknown(other.to_string())),
      },
    }
  }
}

/// Agent events
#[derive(Debug)]
pub enum Event {
  Input(Input),
  /// Periodic tick; picks up queue changes made by other processes
  Tick,
  /// Stdin closed
  Eof,
}

/// Event handler that produces events from console input and a tick timer
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    let input_tx = tx.clone();
    tokio::spawn(async move {
      let mut lines = BufReader::new(tokio::io::stdin()).lines();
      loop {
        match lines.next_line().await {
          Ok(Some(line)) => {
            if let Some(input) = Input::parse(&line) {
              if input_tx.send(Event::Input(input)).is_err() {
                break;
              }
            }
          }
          Ok(None) | Err(_) => {
            let _ = input_tx.send(Event::Eof);
            break;
          }
        }
      }
    });

    tokio::spawn(async move {
      let mut ticks = interval(tick_rate);
      ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticks.tick().await;
        if tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_input() {
    assert_eq!(Input::parse("  flush "), Some(Input::Flush));
    assert_eq!(Input::parse("s"), Some(Input::Status));
    assert_eq!(Input::parse("exit"), Some(Input::Quit));
    assert_eq!(Input::parse(""), None);
    assert_eq!(Input::parse("y"), Some(Input::Answer(true)));
    assert_eq!(Input::parse("update  v3"), Some(Input::Update("v3".to_string())));
    assert_eq!(Input::parse("update"), Some(Input::Unknown("update".to_string())));
    assert_eq!(Input::parse("sync"), Some(Input::Unknown("sync".to_string())));
  }
}
