#![cfg(unix)]

mod common;

mod control_close_all_when_empty;
mod forward_jump_failure_names_hop;
mod forward_shared_session;
mod forward_through_proxy_jump;
mod known_hosts_rejects_unknown_key;
mod lib_single_instance;
mod restart_restores_forwards;
