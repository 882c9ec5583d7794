use crate::config::models::{ GlobalConfig, LocationConfig, ServerConfig };
use crate::http::request::{ Request, HTTP_VERSION };
use crate::http::response::{ Response, StatusCode };

use std::collections::HashMap;
use std::io::{ ErrorKind, Read, Write };
use std::path::Path;
use std::process::{ Child, Command, ExitStatus, Stdio };
use std::thread;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CgiError {
    #[error("failed to execute CGI {script}: {source}")]
    Spawn {
        script: String,
        #[source]
        source: std::io::Error,
    },
    #[error("CGI stdin write failed: {0}")]
    Stdin(#[source] std::io::Error),
    #[error("CGI stdout read failed: {0}")]
    Stdout(#[source] std::io::Error),
    #[error("waiting for CGI failed: {0}")]
    Wait(#[source] std::io::Error),
    #[error("CGI exited with {0}")]
    Exit(std::process::ExitStatus),
    #[error("malformed CGI output: {0}")]
    Output(String),
}

/// Everything a CGI run needs, resolved by the router.
pub struct CgiContext<'a> {
    pub request: &'a Request,
    pub location: &'a LocationConfig,
    pub server: &'a ServerConfig,
    pub config: &'a GlobalConfig,
    /// Document root resolved for the matched location.
    pub root: &'a Path,
    /// Script on disk.
    pub script: &'a Path,
    /// URI path of the script itself.
    pub script_name: &'a str,
    /// URI path after the script name.
    pub path_info: &'a str,
}

/// Runs a CGI script for a request and fills the response. The router turns
/// an `Err` into a 500.
pub trait CgiHandler {
    fn execute(&self, ctx: &CgiContext<'_>, response: &mut Response) -> Result<(), CgiError>;
}

/// Spawns the script as a child process and blocks until it exits.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessCgi;

impl CgiHandler for ProcessCgi {
    fn execute(&self, ctx: &CgiContext<'_>, response: &mut Response) -> Result<(), CgiError> {
        let script = std::fs::canonicalize(ctx.script).unwrap_or_else(|_| ctx.script.to_path_buf());
        let script_str = script.to_string_lossy().to_string();

        let interpreter = ctx.location.cgi_interpreter.as_deref();
        let child = spawn_cgi_process(&script, interpreter, meta_variables(ctx, &script_str))?;
        let (status, stdout) = communicate(child, &ctx.request.body)?;
        if !status.success() {
            return Err(CgiError::Exit(status));
        }
        debug!(script = %script_str, bytes = stdout.len(), "CGI finished");

        *response = parse_cgi_output(&stdout)?;
        Ok(())
    }
}

pub fn spawn_cgi_process(
    script_path: &Path,
    interpreter: Option<&str>,
    env_vars: HashMap<String, String>
) -> Result<Child, CgiError> {
    let mut command = if let Some(interpreter_path) = interpreter {
        let mut cmd = Command::new(interpreter_path);
        cmd.arg(script_path);
        cmd
    } else {
        Command::new(script_path)
    };
    if let Some(dir) = script_path.parent() {
        command.current_dir(dir);
    }

    command
        .env_clear()
        .envs(env_vars)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|source| CgiError::Spawn {
            script: script_path.display().to_string(),
            source,
        })
}

/// Feeds `body` to the child's stdin while draining its stdout, then reaps
/// it. The child is killed and reaped on every error path.
pub fn communicate(mut child: Child, body: &[u8]) -> Result<(ExitStatus, Vec<u8>), CgiError> {
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();

    let io = thread::scope(|scope| {
        let writer = scope.spawn(move || -> std::io::Result<()> {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            // A script may exit without reading its input.
            match stdin.write_all(body) {
                Err(e) if e.kind() != ErrorKind::BrokenPipe => Err(e),
                _ => Ok(()),
            }
        });

        let mut output = Vec::new();
        let read = match stdout {
            Some(mut stdout) => stdout.read_to_end(&mut output).map(|_| output),
            None => Ok(output),
        };
        if read.is_err() {
            // Unblocks the writer if the child stopped reading.
            let _ = child.kill();
        }
        let written = writer
            .join()
            .unwrap_or_else(|_| Err(std::io::Error::other("stdin writer panicked")));
        (read, written)
    });

    let output = match io {
        (Ok(output), Ok(())) => output,
        (Err(e), _) => {
            reap(&mut child);
            return Err(CgiError::Stdout(e));
        }
        (_, Err(e)) => {
            reap(&mut child);
            return Err(CgiError::Stdin(e));
        }
    };

    match child.wait() {
        Ok(status) => Ok((status, output)),
        Err(e) => {
            reap(&mut child);
            Err(CgiError::Wait(e))
        }
    }
}

fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn meta_variables(ctx: &CgiContext<'_>, script_filename: &str) -> HashMap<String, String> {
    let request = ctx.request;
    let mut env = HashMap::new();
    env.insert("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string());
    env.insert("SERVER_PROTOCOL".to_string(), HTTP_VERSION.to_string());
    env.insert("SERVER_SOFTWARE".to_string(), crate::http::response::SERVER_NAME.to_string());
    env.insert("REQUEST_METHOD".to_string(), request.method.to_string());
    env.insert("REQUEST_URI".to_string(), request.uri.clone());
    env.insert("SCRIPT_FILENAME".to_string(), script_filename.to_string());
    env.insert("SCRIPT_NAME".to_string(), ctx.script_name.to_string());
    env.insert("PATH_INFO".to_string(), ctx.path_info.to_string());
    env.insert("QUERY_STRING".to_string(), request.query().unwrap_or("").to_string());
    env.insert("CONTENT_LENGTH".to_string(), request.body.len().to_string());
    if let Some(ct) = request.content_type() {
        env.insert("CONTENT_TYPE".to_string(), ct.to_string());
    }
    let server_name = ctx.server.server_names.first().cloned().unwrap_or_else(|| ctx.server.listen.address.clone());
    env.insert("SERVER_NAME".to_string(), server_name);
    env.insert("SERVER_PORT".to_string(), ctx.server.listen.port.to_string());
    env.insert("DOCUMENT_ROOT".to_string(), ctx.root.display().to_string());
    if let Ok(path) = std::env::var("PATH") {
        env.insert("PATH".to_string(), path);
    }

    for (key, value) in request.headers.iter() {
        if key == "content-type" || key == "content-length" {
            continue;
        }
        let name = format!("HTTP_{}", key.to_ascii_uppercase().replace('-', "_"));
        env.insert(name, value.to_string());
    }
    env
}

/// CGI output is a header block, a blank line, then the body. A `Status:`
/// header sets the response status; output starting with `HTTP/` carries
/// its own status line.
pub fn parse_cgi_output(output: &[u8]) -> Result<Response, CgiError> {
    let (header_part, body_part) = if let Some(pos) = output.windows(4).position(|w| w == b"\r\n\r\n") {
        (&output[..pos], &output[pos + 4..])
    } else if let Some(pos) = output.windows(2).position(|w| w == b"\n\n") {
        (&output[..pos], &output[pos + 2..])
    } else {
        (&[][..], output)
    };

    let header_str = std::str::from_utf8(header_part)
        .map_err(|_| CgiError::Output("header block is not valid UTF-8".into()))?;

    let mut response = Response::new(StatusCode::OK);
    let mut lines = header_str.lines().peekable();

    if let Some(&first) = lines.peek() {
        if first.starts_with("HTTP/") {
            let code = first.split_whitespace().nth(1).and_then(|c| c.parse::<u16>().ok());
            response.status = StatusCode(code.ok_or_else(|| CgiError::Output(format!("status line {:?}", first)))?);
            lines.next();
        }
    }

    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| CgiError::Output(format!("header line {:?}", line)))?;
        let value = value.trim();
        if key.trim().eq_ignore_ascii_case("status") {
            let code = value.split_whitespace().next().and_then(|c| c.parse::<u16>().ok());
            response.status = StatusCode(code.ok_or_else(|| CgiError::Output(format!("status {:?}", value)))?);
        } else {
            response.headers.insert(key, value);
        }
    }

    if !response.headers.contains("content-type") {
        response.headers.insert("content-type", "text/plain");
    }
    // Length is recomputed when the response is finalized.
    response.headers.remove("content-length");
    response.body = body_part.to_vec();
    Ok(response)
}
