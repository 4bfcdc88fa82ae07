use domain::{DeviceTarget, Platform};
use netops_session::{SessionConnector, SessionError, TcpCliConfig, TcpCliConnector};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

const PASSWORD: &str = "secret";

async fn spawn_fake_device() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve(stream));
        }
    });
    addr
}

async fn serve(stream: TcpStream) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    if writer
        .write_all(b"User Access Verification\r\n\r\nUsername: ")
        .await
        .is_err()
    {
        return;
    }
    let Ok(Some(_username)) = lines.next_line().await else {
        return;
    };
    let _ = writer.write_all(b"Password: ").await;
    let Ok(Some(password)) = lines.next_line().await else {
        return;
    };
    if password.trim() != PASSWORD {
        let _ = writer
            .write_all(b"\r\n% Authentication failed\r\n\r\nUsername: ")
            .await;
        return;
    }
    let _ = writer.write_all(b"\r\nsw1#").await;

    let mut in_config = false;
    while let Ok(Some(line)) = lines.next_line().await {
        let command = line.trim().to_string();
        let body = match command.as_str() {
            "exit" => return,
            "terminal length 0" => String::new(),
            "configure terminal" => {
                in_config = true;
                String::new()
            }
            "end" => {
                in_config = false;
                String::new()
            }
            "show version" => "Cisco IOS Software, Version 15.2(4)E\r\nuptime is 3 weeks\r\n".to_string(),
            "slow" => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                String::new()
            }
            other if in_config && (other.starts_with("hostname ") || other.starts_with("interface ")) => {
                String::new()
            }
            _ => "% Invalid input detected at '^' marker.\r\n".to_string(),
        };
        let prompt = if in_config { "sw1(config)#" } else { "sw1#" };
        let reply = format!("{}\r\n{}{}", command, body, prompt);
        if writer.write_all(reply.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// VRP 风格设备：配置输出含大量 `#` 行，且按多次写出（中间有停顿）。
async fn spawn_fake_vrp_device() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_vrp(stream));
        }
    });
    addr
}

async fn serve_vrp(stream: TcpStream) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let _ = writer.write_all(b"Username:").await;
    let Ok(Some(_username)) = lines.next_line().await else {
        return;
    };
    let _ = writer.write_all(b"Password:").await;
    let Ok(Some(_password)) = lines.next_line().await else {
        return;
    };
    let _ = writer.write_all(b"\r\nInfo: The max number of VTY users is 5.\r\n<HUAWEI>").await;

    while let Ok(Some(line)) = lines.next_line().await {
        let command = line.trim().to_string();
        let parts: Vec<Vec<u8>> = match command.as_str() {
            "exit" | "quit" => return,
            "display current-configuration" => vec![
                b"display current-configuration\r\n#\r\nsysname HUAWEI\r\n#".to_vec(),
                b"\r\ninterface GE0/0/1\r\n#\r\nreturn\r\n<HUAWEI>".to_vec(),
            ],
            "display version" => {
                let text = "display version\r\nVRP 设备\r\n<HUAWEI>".as_bytes();
                // 第二段从“设”的第二个字节开始
                let split = "display version\r\nVRP ".len() + 1;
                vec![text[..split].to_vec(), text[split..].to_vec()]
            }
            other => vec![format!("{}\r\n<HUAWEI>", other).into_bytes()],
        };
        for (index, part) in parts.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            if writer.write_all(part).await.is_err() {
                return;
            }
            let _ = writer.flush().await;
        }
    }
}

fn target(addr: SocketAddr, password: &str) -> DeviceTarget {
    DeviceTarget::new("sw1", "127.0.0.1", "admin", password)
        .with_port(addr.port())
        .with_platform(Platform::CiscoIos)
}

fn connector() -> TcpCliConnector {
    TcpCliConnector::new(TcpCliConfig {
        connect_timeout: Duration::from_secs(2),
        login_timeout: Duration::from_secs(2),
        disable_paging: true,
    })
}

#[tokio::test]
async fn login_and_run_commands() {
    let addr = spawn_fake_device().await;
    let mut session = match connector().open(&target(addr, PASSWORD)).await {
        Ok(session) => session,
        Err(err) => panic!("open failed: {}", err),
    };
    assert!(session.is_alive());

    let response = session
        .send_command("show version", Duration::from_secs(2))
        .await
        .expect("show version");
    assert!(!response.failed);
    assert!(response.output.contains("Version 15.2"));
    assert!(!response.output.contains("sw1#"));

    let response = session
        .send_command("show bogus", Duration::from_secs(2))
        .await
        .expect("bogus");
    assert!(response.failed);

    session.close().await.expect("close");
    assert!(!session.is_alive());
}

#[tokio::test]
async fn config_lines_are_wrapped_in_config_mode() {
    let addr = spawn_fake_device().await;
    let mut session = match connector().open(&target(addr, PASSWORD)).await {
        Ok(session) => session,
        Err(err) => panic!("open failed: {}", err),
    };

    let lines = vec![
        "hostname edge-1".to_string(),
        "interface GigabitEthernet0/1".to_string(),
    ];
    let response = session
        .send_config(&lines, Duration::from_secs(2))
        .await
        .expect("config");
    assert!(!response.failed);

    // 退出配置模式后普通命令仍可执行。
    let response = session
        .send_command("show version", Duration::from_secs(2))
        .await
        .expect("show version");
    assert!(!response.failed);
}

#[tokio::test]
async fn wrong_password_is_authentication_error() {
    let addr = spawn_fake_device().await;
    match connector().open(&target(addr, "wrong")).await {
        Err(SessionError::Authentication(_)) => {}
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("login should fail"),
    }
}

#[tokio::test]
async fn refused_connection_is_connectivity_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    match connector().open(&target(addr, PASSWORD)).await {
        Err(SessionError::Connectivity(_)) => {}
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("connect should fail"),
    }
}

#[tokio::test]
async fn command_timeout_invalidates_session() {
    let addr = spawn_fake_device().await;
    let mut session = match connector().open(&target(addr, PASSWORD)).await {
        Ok(session) => session,
        Err(err) => panic!("open failed: {}", err),
    };

    let result = session.send_command("slow", Duration::from_millis(100)).await;
    assert!(matches!(result, Err(SessionError::Timeout(_))));
    assert!(!session.is_alive());
}

#[tokio::test]
async fn split_output_with_hash_lines_is_read_to_device_prompt() {
    let addr = spawn_fake_vrp_device().await;
    let device = DeviceTarget::new("core-1", "127.0.0.1", "admin", PASSWORD)
        .with_port(addr.port())
        .with_platform(Platform::Huawei);
    let mut session = match connector().open(&device).await {
        Ok(session) => session,
        Err(err) => panic!("open failed: {}", err),
    };

    let backup = session
        .send_command("display current-configuration", Duration::from_secs(2))
        .await
        .expect("backup");
    assert_eq!(
        backup.output,
        "#\nsysname HUAWEI\n#\ninterface GE0/0/1\n#\nreturn"
    );

    // 上一条命令的输出不会残留到下一条。
    let version = session
        .send_command("display version", Duration::from_secs(2))
        .await
        .expect("version");
    assert_eq!(version.output, "VRP 设备");
    assert!(!version.output.contains('\u{FFFD}'));
}
