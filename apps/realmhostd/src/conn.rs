//! Per-connection task: login, out-of-band commands, and the relay
//! between the socket and whatever instance the player occupies.
//!
//! Lines starting with `@` (plus a few bare words like `who` and
//! `quit`) are handled here; everything else is rewritten through the
//! chat shorthands and queued to the player's instance.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use realmio::clean::clean_line;
use realmio::line::LineReader;
use realmproto::access::{AccessLevel, Privacy};
use realmproto::chat::rewrite_shorthand;
use realmproto::worker::input_line;

use crate::error::HostError;
use crate::events::Command;
use crate::host::{Host, DEFAULT_INSTANCE};
use crate::player::{Connection, Player};
use crate::realm::Realm;

const MAX_LOGIN_ATTEMPTS: u32 = 5;
const CLIENT_MAX_LINE: usize = 1024;

enum Flow {
    Continue,
    Quit,
}

pub async fn serve<S>(host: Arc<Host>, stream: S, peer: String)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (rd, mut wr) = tokio::io::split(stream);
    let mut reader = LineReader::new(rd).max_line_len(CLIENT_MAX_LINE);
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if wr.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if wr.write_all(b"\r\n").await.is_err() {
                break;
            }
        }
        let _ = wr.shutdown().await;
    });

    let send = |line: &str| {
        let _ = tx.send(line.to_string());
    };

    send(&format!("realmhost {}", env!("CARGO_PKG_VERSION")));
    send("  connect <name> <password>   log in");
    send("  connect guest [name]        drop by");
    send("  create <name> <password>    register");

    let player = match login(&host, &mut reader, &send).await {
        Some(p) => p,
        None => {
            drop(tx);
            let _ = writer.await;
            return;
        }
    };
    info!(peer = %peer, player = %player.name, "logged in");

    let conn = Arc::new(Connection::new(tx.clone()));
    player.state.write().conn = Some(conn.clone());
    send(&format!("Welcome, {}.", player.name));

    if let Err(e) = host
        .join_realm(&player, &host.cfg.start_realm, DEFAULT_INSTANCE)
        .await
    {
        warn!(player = %player.name, err = %e, "could not enter start realm");
        send("The start realm is unavailable; you drift in the void.");
    }

    loop {
        let raw = match reader.read_line().await {
            Ok(Some(raw)) => raw,
            Ok(None) => break,
            Err(e) => {
                debug!(peer = %peer, err = %e, "read error");
                break;
            }
        };
        conn.note_input();
        let line = clean_line(&raw);
        if line.is_empty() {
            continue;
        }
        match handle_line(&host, &player, &line, &send).await {
            Flow::Continue => {}
            Flow::Quit => break,
        }
    }

    host.leave_current(&player).await;
    player.state.write().conn = None;
    host.on_disconnect(&player);
    info!(peer = %peer, player = %player.name, "disconnected");
    drop(tx);
    let _ = writer.await;
}

async fn login<R>(
    host: &Arc<Host>,
    reader: &mut LineReader<R>,
    send: &impl Fn(&str),
) -> Option<Arc<Player>>
where
    R: AsyncRead + Unpin,
{
    for _ in 0..MAX_LOGIN_ATTEMPTS {
        let raw = match reader.read_line().await {
            Ok(Some(raw)) => raw,
            _ => return None,
        };
        let line = clean_line(&raw);
        let mut words = line.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some("quit"), _, _) => return None,
            (Some("who"), _, _) => cmd_who(host, send),
            (Some("connect"), Some("guest"), wanted) => {
                let player = host.guest_player(wanted.unwrap_or("Guest"));
                return Some(player);
            }
            (Some("connect"), Some(name), Some(pw)) => match host.login(name, pw) {
                Ok(player) => {
                    if player.state.read().conn.is_some() {
                        send("That player is already connected.");
                        continue;
                    }
                    return Some(player);
                }
                Err(_) => send("Wrong name or password."),
            },
            (Some("create"), Some(name), Some(pw)) => match host.create_account(name, pw) {
                Ok(player) => return Some(player),
                Err(e) => send(&format!("Cannot create that account: {e}")),
            },
            _ => send("Say: connect <name> <password>, connect guest, or create <name> <password>."),
        }
    }
    send("Too many attempts.");
    None
}

async fn handle_line(
    host: &Arc<Host>,
    player: &Arc<Player>,
    line: &str,
    send: &impl Fn(&str),
) -> Flow {
    // `again` repeats the previous command verbatim.
    let line = if line == "again" || line == "g" {
        match player.state.read().last_command.clone() {
            Some(prev) => prev,
            None => {
                send("Nothing to repeat.");
                return Flow::Continue;
            }
        }
    } else {
        player.state.write().last_command = Some(line.to_string());
        line.to_string()
    };

    let mut words = line.split_whitespace();
    let head = words.next().unwrap_or("");
    let rest = line[head.len()..].trim_start().to_string();

    match head {
        "quit" => {
            send("Come back soon.");
            return Flow::Quit;
        }
        "who" => cmd_who(host, send),
        "home" => {
            join(host, player, &host.cfg.start_realm.clone(), DEFAULT_INSTANCE, send).await;
        }
        "page" => cmd_page(host, player, &rest, send),
        "@realms" => cmd_realms(host, player, send),
        "@join" => {
            let Some((realm, inst)) = parse_target(&rest) else {
                send("Usage: @join <realm>[/<instance>]");
                return Flow::Continue;
            };
            join(host, player, &realm, &inst, send).await;
        }
        "@create" => cmd_create(host, player, &rest, send).await,
        "@replace" => cmd_replace(host, player, &rest, send).await,
        "@delete" => cmd_delete(host, player, &rest, send).await,
        "@privacy" => cmd_privacy(host, player, &rest, send),
        "@acl" => cmd_acl(host, player, &rest, send),
        "@teleport" => cmd_teleport(host, player, &rest, send).await,
        "@restart" => cmd_restart(host, player, &rest, send),
        "@raw" => cmd_raw(host, player, &rest, send),
        "@wall" => cmd_wall(host, player, &rest, send),
        "@shutdown" => {
            if !player.admin {
                send("Admins only.");
                return Flow::Continue;
            }
            info!(player = %player.name, "shutdown requested");
            host.post_command(Command::Shutdown);
        }
        _ => relay(host, player, &line, send),
    }
    Flow::Continue
}

/// Forward a plain line to the player's instance.
fn relay(host: &Arc<Host>, player: &Arc<Player>, line: &str, send: &impl Fn(&str)) {
    let key = player.state.read().instance.clone();
    let Some(key) = key else {
        send("You are nowhere. Try 'home'.");
        return;
    };
    let Some(inst) = host.instance(&key) else {
        send("You are nowhere. Try 'home'.");
        return;
    };
    let Some(sid) = inst.session_of(player.id) else {
        send("You are nowhere. Try 'home'.");
        return;
    };
    let rewritten = rewrite_shorthand(line);
    inst.queue_input(&input_line(sid, &rewritten));
}

async fn join(
    host: &Arc<Host>,
    player: &Arc<Player>,
    realm: &str,
    instance: &str,
    send: &impl Fn(&str),
) {
    match host.join_realm(player, realm, instance).await {
        Ok(()) => {}
        Err(HostError::PermissionDenied { .. }) | Err(HostError::UnknownRealm(_)) => {
            // One message for both, to avoid confirming hidden realms.
            send("No such realm.");
        }
        Err(e) => send(&format!("Cannot join: {e}")),
    }
}

fn cmd_who(host: &Arc<Host>, send: &impl Fn(&str)) {
    let mut players = host.players.connected();
    players.sort_by(|a, b| a.name.cmp(&b.name));
    send("Name              Idle  Where");
    for p in &players {
        let idle = p.idle().map(|d| d.as_secs()).unwrap_or(0);
        let place = p
            .state
            .read()
            .instance
            .as_deref()
            .and_then(|k| k.split('/').next().map(str::to_string))
            .unwrap_or_else(|| "-".into());
        let flag = if p.admin { "*" } else { "" };
        send(&format!("{:<17} {:>4}  {}{}", p.name, idle, place, flag));
    }
    send(&format!("{} connected.", players.len()));
}

/// `page <name>=<msg>`; a `:`-prefixed message reads as a pose.
fn cmd_page(host: &Arc<Host>, player: &Arc<Player>, rest: &str, send: &impl Fn(&str)) {
    let Some((name, msg)) = rest.split_once('=') else {
        send("Usage: page <player>=<message>");
        return;
    };
    let (name, msg) = (name.trim(), msg.trim());
    if name.is_empty() || msg.is_empty() {
        send("Usage: page <player>=<message>");
        return;
    }
    let Some(target) = host.players.get(name) else {
        send("They are not connected.");
        return;
    };
    if target.state.read().conn.is_none() {
        send("They are not connected.");
        return;
    }
    if let Some(act) = msg.strip_prefix(':') {
        target.send_line(&format!("From afar, {} {}", player.name, act.trim_start()));
        send(&format!("To {}: {} {}", target.name, player.name, act.trim_start()));
    } else {
        target.send_line(&format!("{} pages: {}", player.name, msg));
        send(&format!("You page {}: {}", target.name, msg));
    }
}

fn cmd_realms(host: &Arc<Host>, player: &Arc<Player>, send: &impl Fn(&str)) {
    send("Realm             Access");
    for name in host.realm_names() {
        let Some(realm) = host.realm(&name) else { continue };
        let level = realm.effective_access(player);
        if level <= AccessLevel::Hidden {
            continue;
        }
        send(&format!("{:<17} {}", realm.name, level.as_str()));
    }
}

async fn cmd_create(host: &Arc<Host>, player: &Arc<Player>, rest: &str, send: &impl Fn(&str)) {
    if player.guest {
        send("Guests cannot create realms.");
        return;
    }
    let mut words = rest.split_whitespace();
    let Some(name) = words.next() else {
        send("Usage: @create <realm> [factory]");
        return;
    };
    let factory = words.next().unwrap_or("echo");
    let template = format!("new realm '{name}'\n");
    match host.load_realm(name, factory, player.id, &template).await {
        Ok(realm) => {
            send(&format!("Realm {} created (private).", realm.name));
        }
        Err(e) => send(&format!("Cannot create realm: {e}")),
    }
}

async fn cmd_replace(host: &Arc<Host>, player: &Arc<Player>, rest: &str, send: &impl Fn(&str)) {
    let mut words = rest.split_whitespace();
    let (Some(from), Some(to)) = (words.next(), words.next()) else {
        send("Usage: @replace <staging> <live>");
        return;
    };
    let Some(live) = host.realm(to) else {
        send("No such realm.");
        return;
    };
    if let Err(e) = require(&live, player, AccessLevel::EditSource) {
        send(&format!("{e}"));
        return;
    }
    match host.replace_realm(from, to).await {
        Ok(()) => send(&format!("Realm {to} now runs the program from {from}.")),
        Err(e) => send(&format!("Swap failed: {e}")),
    }
}

async fn cmd_delete(host: &Arc<Host>, player: &Arc<Player>, rest: &str, send: &impl Fn(&str)) {
    let name = rest.trim();
    if name.is_empty() {
        send("Usage: @delete <realm>");
        return;
    }
    let Some(realm) = host.realm(name) else {
        send("No such realm.");
        return;
    };
    if let Err(e) = require(&realm, player, AccessLevel::Owner) {
        send(&format!("{e}"));
        return;
    }
    match host.delete_realm(name).await {
        Ok(()) => send(&format!("Realm {name} deleted.")),
        Err(e) => send(&format!("Cannot delete: {e}")),
    }
}

fn cmd_privacy(host: &Arc<Host>, player: &Arc<Player>, rest: &str, send: &impl Fn(&str)) {
    let mut words = rest.split_whitespace();
    let (Some(name), Some(level)) = (words.next(), words.next()) else {
        send("Usage: @privacy <realm> <private|hidden|public|joinable|viewable>");
        return;
    };
    let Some(realm) = host.realm(name) else {
        send("No such realm.");
        return;
    };
    if let Err(e) = require(&realm, player, AccessLevel::EditSettings) {
        send(&format!("{e}"));
        return;
    }
    let Some(privacy) = Privacy::parse(level) else {
        send("Unknown privacy level.");
        return;
    };
    realm.set_privacy(privacy);
    host.persist_realms();
    send(&format!("Realm {} is now {}.", realm.name, privacy.as_str()));
}

fn cmd_acl(host: &Arc<Host>, player: &Arc<Player>, rest: &str, send: &impl Fn(&str)) {
    let mut words = rest.split_whitespace();
    let (Some(name), Some(who), Some(level)) = (words.next(), words.next(), words.next()) else {
        send("Usage: @acl <realm> <player> <level|none>");
        return;
    };
    let Some(realm) = host.realm(name) else {
        send("No such realm.");
        return;
    };
    if let Err(e) = require(&realm, player, AccessLevel::EditAccess) {
        send(&format!("{e}"));
        return;
    }
    let Some(target) = host.players.get(who) else {
        send("No such player.");
        return;
    };
    if level.eq_ignore_ascii_case("none") {
        realm.set_acl(target.id, None);
        host.persist_realms();
        send(&format!("{} removed from the {} list.", target.name, realm.name));
        return;
    }
    let Some(level) = AccessLevel::parse(level) else {
        send("Unknown access level.");
        return;
    };
    if level >= AccessLevel::Owner {
        send("Ownership is not granted through the list.");
        return;
    }
    realm.set_acl(target.id, Some(level));
    host.persist_realms();
    send(&format!(
        "{} is now {} on {}.",
        target.name,
        level.as_str(),
        realm.name
    ));
}

/// `@teleport <realm>` jumps yourself; admins may also move someone
/// else with `@teleport <player> <realm>`.
async fn cmd_teleport(host: &Arc<Host>, player: &Arc<Player>, rest: &str, send: &impl Fn(&str)) {
    let mut words = rest.split_whitespace();
    match (words.next(), words.next()) {
        (Some(target), None) => {
            let Some((realm, inst)) = parse_target(target) else {
                send("Usage: @teleport <realm>[/<instance>]");
                return;
            };
            join(host, player, &realm, &inst, send).await;
        }
        (Some(who), Some(target)) => {
            if !player.admin {
                send("Admins only.");
                return;
            }
            let Some(victim) = host.players.get(who) else {
                send("No such player.");
                return;
            };
            let Some((realm, inst)) = parse_target(target) else {
                send("Bad destination.");
                return;
            };
            match host.join_realm(&victim, &realm, &inst).await {
                Ok(()) => {
                    victim.send_line("A giant hand plucks you up and sets you down elsewhere.");
                    send(&format!("{} moved to {}.", victim.name, target));
                }
                Err(e) => send(&format!("Cannot teleport: {e}")),
            }
        }
        _ => send("Usage: @teleport [<player>] <realm>[/<instance>]"),
    }
}

/// Ask an instance to wind down and come back up; its players ride
/// through the restart.
fn cmd_restart(host: &Arc<Host>, player: &Arc<Player>, rest: &str, send: &impl Fn(&str)) {
    let Some((realm_name, inst_name)) = parse_target(rest) else {
        send("Usage: @restart <realm>[/<instance>]");
        return;
    };
    let Some(realm) = host.realm(&realm_name) else {
        send("No such realm.");
        return;
    };
    if let Err(e) = require(&realm, player, AccessLevel::EditSettings) {
        send(&format!("{e}"));
        return;
    }
    let key = format!("{}/{}", realm.name_lc, inst_name);
    let Some(inst) = host.instance(&key) else {
        send("That instance is not running.");
        return;
    };
    inst.request_restart();
    inst.request_shutdown();
    send(&format!("Restart requested for {key}."));
}

/// Toggle raw mode: no tag demultiplexing, no join/part probes,
/// output broadcast verbatim. Debugging aid.
fn cmd_raw(host: &Arc<Host>, player: &Arc<Player>, rest: &str, send: &impl Fn(&str)) {
    if !player.admin {
        send("Admins only.");
        return;
    }
    let mut words = rest.split_whitespace();
    let (Some(target), Some(mode)) = (words.next(), words.next()) else {
        send("Usage: @raw <realm>[/<instance>] on|off");
        return;
    };
    let Some((realm_name, inst_name)) = parse_target(target) else {
        send("Usage: @raw <realm>[/<instance>] on|off");
        return;
    };
    let Some(realm) = host.realm(&realm_name) else {
        send("No such realm.");
        return;
    };
    let key = format!("{}/{}", realm.name_lc, inst_name);
    let Some(inst) = host.instance(&key) else {
        send("That instance is not running.");
        return;
    };
    match mode {
        "on" => {
            inst.set_raw_mode(true);
            send(&format!("{key} is now raw."));
        }
        "off" => {
            inst.set_raw_mode(false);
            send(&format!("{key} is demultiplexing again."));
        }
        _ => send("Usage: @raw <realm>[/<instance>] on|off"),
    }
}

fn cmd_wall(host: &Arc<Host>, player: &Arc<Player>, rest: &str, send: &impl Fn(&str)) {
    if !player.admin {
        send("Admins only.");
        return;
    }
    let msg = rest.trim();
    if msg.is_empty() {
        send("Usage: @wall <message>");
        return;
    }
    for p in host.players.connected() {
        p.send_line(&format!("[announcement] {}: {}", player.name, msg));
    }
}

fn require(realm: &Arc<Realm>, player: &Arc<Player>, need: AccessLevel) -> Result<(), HostError> {
    let have = realm.effective_access(player);
    if have >= need {
        Ok(())
    } else {
        Err(HostError::PermissionDenied { need, have })
    }
}

/// `"lab"` or `"lab/side"` => `(realm, instance)`.
fn parse_target(s: &str) -> Option<(String, String)> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    match s.split_once('/') {
        Some((r, i)) if !r.is_empty() && !i.is_empty() => Some((r.to_string(), i.to_string())),
        Some(_) => None,
        None => Some((s.to_string(), DEFAULT_INSTANCE.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::NoopCompiler;
    use crate::demo::EchoFactory;
    use crate::host::Config;
    use crate::store::Store;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use realmproto::worker::WorkerFactory;

    fn test_host() -> (Arc<Host>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let (post, rx) = mpsc::unbounded_channel();
        std::mem::forget(rx);
        let mut factories: HashMap<String, Arc<dyn WorkerFactory>> = HashMap::new();
        factories.insert("echo".into(), Arc::new(EchoFactory));
        let cfg = Config {
            data_dir: dir.path().to_path_buf(),
            admin_name: Some("Root".into()),
            ..Config::default()
        };
        let host = Host::new(cfg, store, Arc::new(NoopCompiler), factories, post);
        host.bootstrap().unwrap();
        (host, dir)
    }

    async fn client(host: &Arc<Host>) -> DuplexStream {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let host = host.clone();
        tokio::spawn(async move { serve(host, server, "test".into()).await });
        client
    }

    async fn write(c: &mut DuplexStream, line: &str) {
        tokio::io::AsyncWriteExt::write_all(c, format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
    }

    /// Read until `pat` shows up (or panic after two seconds).
    async fn expect(c: &mut DuplexStream, pat: &str) -> String {
        let mut seen = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if seen.contains(pat) {
                return seen;
            }
            let mut buf = [0u8; 1024];
            let n = tokio::time::timeout_at(deadline, c.read(&mut buf))
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {pat:?}; saw: {seen}"))
                .expect("read");
            if n == 0 {
                panic!("eof waiting for {pat:?}; saw: {seen}");
            }
            seen.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    }

    #[tokio::test]
    async fn guest_lands_in_the_start_realm_and_is_echoed() {
        let (host, _dir) = test_host();
        let mut c = client(&host).await;
        expect(&mut c, "realmhost").await;
        write(&mut c, "connect guest Ada").await;
        expect(&mut c, "Welcome, Ada.").await;
        expect(&mut c, "echo chamber").await;

        write(&mut c, "hello world").await;
        expect(&mut c, "Echo: hello world").await;

        // Shorthand goes through the chat rewrite.
        write(&mut c, "\"hi all").await;
        expect(&mut c, "Ada says, \"hi all\"").await;

        write(&mut c, "quit").await;
        expect(&mut c, "Come back soon.").await;
        host.shutdown_all().await;
    }

    #[tokio::test]
    async fn account_creation_then_login_roundtrip() {
        let (host, _dir) = test_host();
        {
            let mut c = client(&host).await;
            expect(&mut c, "realmhost").await;
            write(&mut c, "create Ada lovelace").await;
            expect(&mut c, "Welcome, Ada.").await;
            write(&mut c, "quit").await;
            expect(&mut c, "Come back soon.").await;
        }
        let mut c = client(&host).await;
        expect(&mut c, "realmhost").await;
        write(&mut c, "connect Ada wrongpw").await;
        expect(&mut c, "Wrong name or password.").await;
        write(&mut c, "connect Ada lovelace").await;
        expect(&mut c, "Welcome, Ada.").await;
        write(&mut c, "quit").await;
        expect(&mut c, "Come back soon.").await;
        host.shutdown_all().await;
    }

    #[tokio::test]
    async fn who_lists_connected_players() {
        let (host, _dir) = test_host();
        let mut a = client(&host).await;
        expect(&mut a, "realmhost").await;
        write(&mut a, "connect guest Ada").await;
        expect(&mut a, "Welcome, Ada.").await;

        let mut b = client(&host).await;
        expect(&mut b, "realmhost").await;
        write(&mut b, "connect guest Bob").await;
        expect(&mut b, "Welcome, Bob.").await;

        write(&mut a, "who").await;
        let seen = expect(&mut a, "2 connected.").await;
        assert!(seen.contains("Ada"));
        assert!(seen.contains("Bob"));
        host.shutdown_all().await;
    }

    #[tokio::test]
    async fn realm_admin_commands_enforce_access() {
        let (host, _dir) = test_host();
        let mut owner = client(&host).await;
        expect(&mut owner, "realmhost").await;
        write(&mut owner, "create Ada lovelace").await;
        expect(&mut owner, "Welcome, Ada.").await;
        write(&mut owner, "@create lab").await;
        expect(&mut owner, "Realm lab created (private).").await;

        let mut other = client(&host).await;
        expect(&mut other, "realmhost").await;
        write(&mut other, "create Bob babbage").await;
        expect(&mut other, "Welcome, Bob.").await;

        // Private realm: invisible to Bob, both for joining and @delete.
        write(&mut other, "@join lab").await;
        expect(&mut other, "No such realm.").await;
        write(&mut other, "@delete lab").await;
        expect(&mut other, "permission denied").await;

        // Ada invites Bob, then Bob can join; `who` proves he moved.
        write(&mut owner, "@acl lab Bob invited").await;
        expect(&mut owner, "Bob is now invited on lab.").await;
        write(&mut other, "@join lab").await;
        write(&mut other, "who").await;
        let seen = expect(&mut other, "2 connected.").await;
        assert!(seen.contains("lab"));
        host.shutdown_all().await;
    }

    #[tokio::test]
    async fn guests_cannot_create_realms() {
        let (host, _dir) = test_host();
        let mut c = client(&host).await;
        expect(&mut c, "realmhost").await;
        write(&mut c, "connect guest Ada").await;
        expect(&mut c, "Welcome, Ada.").await;
        write(&mut c, "@create lab").await;
        expect(&mut c, "Guests cannot create realms.").await;
        host.shutdown_all().await;
    }

    #[test]
    fn target_parsing() {
        assert_eq!(
            parse_target("lab"),
            Some(("lab".into(), "default".into()))
        );
        assert_eq!(
            parse_target("lab/side"),
            Some(("lab".into(), "side".into()))
        );
        assert_eq!(parse_target("lab/"), None);
        assert_eq!(parse_target(""), None);
    }
}
