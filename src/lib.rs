// src/lib.rs

#![doc = r#"
# Hotswap

Hotswap keeps one HTTP/WebSocket listener alive while the compiled handler
module behind it is rebuilt and swapped in place. Existing connections and the
listening socket survive every reload.

## Modules

- [`config`]: Configuration loading and merging from CLI, file, and environment.
- [`module`]: The swappable module capability set and the source it is loaded from.
- [`dylib`]: Shared-library module source (build command, staging, C capability table).
- [`registry`]: Bounded per-channel sets of streaming clients.
- [`reload`]: Reload request flag and the coordinator that owns the active module.
- [`broadcaster`]: Periodic push of the module's payload to time-channel clients.
- [`watcher`]: Source directory change detection on a dedicated thread.
- [`event_loop`]: The loop that owns all host state and runs reload cycles.
- [`web`]: Listener, HTTP dispatch and WebSocket channel transport.
"#]

pub mod broadcaster;
pub mod config;
pub mod dylib;
pub mod event_loop;
pub mod module;
pub mod registry;
pub mod reload;
pub mod watcher;
pub mod web;
