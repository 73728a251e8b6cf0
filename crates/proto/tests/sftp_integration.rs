//! SFTP round-trip tests against a live server.

use keel_platform::{KeelError, KeelResult};
use keel_proto::ssh::client::SshClient;
use keel_proto::ssh::server::SshServer;
use keel_proto::ssh::sftp::client::OpenOptions;
use keel_proto::ssh::sftp::FileAttributes;
use keel_proto::ssh::{Config, PasswordAuthenticator, StaticKeyProvider};
use md5::{Digest, Md5};
use rand::RngCore;
use std::sync::Arc;
use tokio::time::{timeout, Duration};

struct AnyPassword;

#[async_trait::async_trait]
impl PasswordAuthenticator for AnyPassword {
    async fn authenticate(&self, _username: &str, _password: &str) -> KeelResult<bool> {
        Ok(true)
    }
}

async fn start_server(config: Config) -> (tokio::task::JoinHandle<KeelResult<()>>, String) {
    let provider = Arc::new(StaticKeyProvider::ephemeral().unwrap());
    let mut server = SshServer::bind_with_config("127.0.0.1:0", config, provider)
        .await
        .unwrap();
    server.set_password_authenticator(Arc::new(AnyPassword));
    let addr = server.local_addr().unwrap().to_string();
    let task = tokio::spawn(async move {
        let mut session = server.accept().await?;
        session.authenticate().await?;
        session.run().await
    });
    (task, addr)
}

async fn sftp_session(
    addr: &str,
    version: u32,
) -> (SshClient, keel_proto::ssh::sftp::SftpClient) {
    let mut client = SshClient::connect(addr).await.unwrap();
    client
        .authenticate_password("tester", "anything")
        .await
        .unwrap();
    let mut sftp = client.sftp().await.unwrap();
    let negotiated = timeout(Duration::from_secs(5), sftp.init(version))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(negotiated, version.min(6));
    (client, sftp)
}

/// Upload 1 MiB of random data, read it back, verify byte equality,
/// remove the file.
#[tokio::test]
async fn test_upload_then_read_v6() {
    let (server_task, addr) = start_server(Config::default()).await;
    let (_client, mut sftp) = sftp_session(&addr, 6).await;
    assert!(sftp.server_extensions().contains_key("versions"));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("upload.bin").display().to_string();

    let mut payload = vec![0u8; 1024 * 1024];
    rand::thread_rng().fill_bytes(&mut payload);

    // CREATE_NEW | WRITE
    let handle = sftp.open(&path, OpenOptions::write_new()).await.unwrap();
    for (i, chunk) in payload.chunks(16 * 1024).enumerate() {
        sftp.write(&handle, (i * 16 * 1024) as u64, chunk)
            .await
            .unwrap();
    }
    sftp.close(&handle).await.unwrap();

    // Read it all back.
    let handle = sftp.open(&path, OpenOptions::read_only()).await.unwrap();
    let mut read_back = Vec::with_capacity(payload.len());
    while let Some(chunk) = sftp
        .read(&handle, read_back.len() as u64, 16 * 1024)
        .await
        .unwrap()
    {
        read_back.extend_from_slice(&chunk);
    }
    sftp.close(&handle).await.unwrap();

    assert_eq!(read_back.len(), payload.len());
    assert_eq!(read_back, payload);

    sftp.remove(&path).await.unwrap();
    assert!(sftp.stat(&path).await.is_err());

    drop(sftp);
    let _ = timeout(Duration::from_secs(5), server_task).await;
}

/// Opening with CREATE_NEW twice must fail the second time.
#[tokio::test]
async fn test_create_new_exclusive() {
    let (server_task, addr) = start_server(Config::default()).await;
    let (_client, mut sftp) = sftp_session(&addr, 6).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("exclusive.bin").display().to_string();

    let handle = sftp.open(&path, OpenOptions::write_new()).await.unwrap();
    sftp.close(&handle).await.unwrap();

    let err = sftp.open(&path, OpenOptions::write_new()).await.unwrap_err();
    assert!(matches!(err, KeelError::Io(ref e) if e.kind() == std::io::ErrorKind::AlreadyExists));

    drop(sftp);
    let _ = timeout(Duration::from_secs(5), server_task).await;
}

/// SETSTAT then STAT: every applied attribute is visible.
#[tokio::test]
async fn test_attribute_round_trip() {
    let (server_task, addr) = start_server(Config::default()).await;
    let (_client, mut sftp) = sftp_session(&addr, 6).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("attrs.bin").display().to_string();
    std::fs::write(&path, vec![0u8; 256]).unwrap();

    let mut attrs = FileAttributes::new();
    attrs.size = Some(100);
    attrs.mtime = Some(1_600_000_000);
    attrs.atime = Some(1_600_000_000);
    #[cfg(unix)]
    {
        attrs.permissions = Some(0o640);
    }
    sftp.setstat(&path, &attrs).await.unwrap();

    let observed = sftp.stat(&path).await.unwrap();
    assert_eq!(observed.size, Some(100));
    assert_eq!(observed.mtime, Some(1_600_000_000));
    #[cfg(unix)]
    assert_eq!(observed.permissions.map(|p| p & 0o777), Some(0o640));

    drop(sftp);
    let _ = timeout(Duration::from_secs(5), server_task).await;
}

/// READDIR synthesizes "." and ".." before the real entries and then
/// reports EOF.
#[tokio::test]
async fn test_readdir_dot_entries() {
    let (server_task, addr) = start_server(Config::default()).await;
    let (_client, mut sftp) = sftp_session(&addr, 3).await;

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
    std::fs::write(dir.path().join("b.txt"), b"b").unwrap();

    let handle = sftp
        .opendir(&dir.path().display().to_string())
        .await
        .unwrap();

    let mut names = Vec::new();
    while let Some(batch) = sftp.readdir(&handle).await.unwrap() {
        names.extend(batch.into_iter().map(|(name, _)| name));
    }
    sftp.close(&handle).await.unwrap();

    assert_eq!(names[0], ".");
    assert_eq!(names[1], "..");
    assert!(names.contains(&"a.txt".to_string()));
    assert!(names.contains(&"b.txt".to_string()));
    assert_eq!(names.len(), 4);

    drop(sftp);
    let _ = timeout(Duration::from_secs(5), server_task).await;
}

/// Outstanding handles never collide.
#[tokio::test]
async fn test_handle_uniqueness() {
    let (server_task, addr) = start_server(Config::default()).await;
    let (_client, mut sftp) = sftp_session(&addr, 6).await;

    let dir = tempfile::tempdir().unwrap();
    let mut handles = std::collections::HashSet::new();
    for i in 0..32 {
        let path = dir.path().join(format!("f{}.bin", i)).display().to_string();
        let handle = sftp.open(&path, OpenOptions::write_new()).await.unwrap();
        assert_eq!(handle.len(), 16);
        assert!(handles.insert(handle), "handle collision at {}", i);
    }

    drop(sftp);
    let _ = timeout(Duration::from_secs(5), server_task).await;
}

/// md5-hash quick check: a wrong quick-check hash yields an empty reply;
/// the matching prefix hash yields the file's MD5.
#[tokio::test]
async fn test_md5_hash_quick_check() {
    let (server_task, addr) = start_server(Config::default()).await;
    let (_client, mut sftp) = sftp_session(&addr, 6).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hash.bin").display().to_string();
    // Smaller than the 2 KiB quick-check prefix, so the prefix hash IS
    // the full hash.
    let content = b"keel md5-hash extension test payload".to_vec();
    std::fs::write(&path, &content).unwrap();

    let expected = Md5::digest(&content).to_vec();

    // Mismatching quick check: empty hash field.
    let mismatch = sftp
        .md5_hash(&path, 0, 0, &vec![0u8; 16])
        .await
        .unwrap();
    assert!(mismatch.is_empty());

    // Matching quick check: the real hash comes back.
    let hash = sftp.md5_hash(&path, 0, 0, &expected).await.unwrap();
    assert_eq!(hash, expected);

    // No quick check at all: hash everything.
    let hash = sftp.md5_hash(&path, 0, 0, &[]).await.unwrap();
    assert_eq!(hash, expected);

    drop(sftp);
    let _ = timeout(Duration::from_secs(5), server_task).await;
}

/// RENAME without the overwrite flag refuses to clobber (v5+).
#[tokio::test]
async fn test_rename_overwrite_flag() {
    let (server_task, addr) = start_server(Config::default()).await;
    let (_client, mut sftp) = sftp_session(&addr, 6).await;

    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a").display().to_string();
    let b = dir.path().join("b").display().to_string();
    std::fs::write(&a, b"a").unwrap();
    std::fs::write(&b, b"b").unwrap();

    let err = sftp.rename(&a, &b, false).await.unwrap_err();
    assert!(matches!(err, KeelError::Io(ref e) if e.kind() == std::io::ErrorKind::AlreadyExists));

    sftp.rename(&a, &b, true).await.unwrap();
    assert_eq!(std::fs::read(&b).unwrap(), b"a");

    drop(sftp);
    let _ = timeout(Duration::from_secs(5), server_task).await;
}

/// version-select accepted as the first request.
#[tokio::test]
async fn test_version_select_first_request() {
    let (server_task, addr) = start_server(Config::default()).await;
    let (_client, mut sftp) = sftp_session(&addr, 6).await;

    sftp.version_select(4).await.unwrap();
    assert_eq!(sftp.version(), 4);

    // The session keeps working at the selected version.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("v4.bin").display().to_string();
    let handle = sftp.open(&path, OpenOptions::write_new()).await.unwrap();
    sftp.write(&handle, 0, b"v4 payload").await.unwrap();
    sftp.close(&handle).await.unwrap();

    drop(sftp);
    let _ = timeout(Duration::from_secs(5), server_task).await;
}

/// A late version-select gets a failure status and the server then
/// disconnects the whole session.
#[tokio::test]
async fn test_version_select_late_disconnects() {
    let (server_task, addr) = start_server(Config::default()).await;
    let (_client, mut sftp) = sftp_session(&addr, 6).await;

    // Any request first...
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("x").display().to_string();
    let _ = sftp.stat(&missing).await;

    // ...makes version-select fail with a status.
    assert!(sftp.version_select(4).await.is_err());

    // The server tears the session down afterwards.
    let result = timeout(Duration::from_secs(5), server_task).await;
    assert!(result.is_ok(), "server session did not end after late version-select");

    drop(sftp);
}

/// Missing files map to a NO_SUCH_FILE status, surfaced as NotFound.
#[tokio::test]
async fn test_stat_missing_file() {
    let (server_task, addr) = start_server(Config::default()).await;
    let (_client, mut sftp) = sftp_session(&addr, 6).await;

    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope").display().to_string();
    let err = sftp.stat(&missing).await.unwrap_err();
    assert!(matches!(err, KeelError::Io(ref e) if e.kind() == std::io::ErrorKind::NotFound));

    drop(sftp);
    let _ = timeout(Duration::from_secs(5), server_task).await;
}

/// mkdir / rmdir / realpath basics.
#[tokio::test]
async fn test_directory_operations() {
    let (server_task, addr) = start_server(Config::default()).await;
    let (_client, mut sftp) = sftp_session(&addr, 6).await;

    let dir = tempfile::tempdir().unwrap();
    let sub = dir.path().join("subdir").display().to_string();

    sftp.mkdir(&sub).await.unwrap();
    assert!(sftp.stat(&sub).await.is_ok());

    let canonical = sftp
        .realpath(&format!("{}/./..//subdir", dir.path().display()))
        .await
        .unwrap();
    assert_eq!(canonical, sub);

    sftp.rmdir(&sub).await.unwrap();
    assert!(sftp.stat(&sub).await.is_err());

    drop(sftp);
    let _ = timeout(Duration::from_secs(5), server_task).await;
}

/// Forced version narrows negotiation.
#[tokio::test]
async fn test_forced_version() {
    let mut config = Config::default();
    config.apply("sftp-version=3").unwrap();
    let (server_task, addr) = start_server(config).await;

    let mut client = SshClient::connect(&addr).await.unwrap();
    client
        .authenticate_password("tester", "anything")
        .await
        .unwrap();
    let mut sftp = client.sftp().await.unwrap();
    let negotiated = sftp.init(6).await.unwrap();
    assert_eq!(negotiated, 3);

    drop(sftp);
    drop(client);
    let _ = timeout(Duration::from_secs(5), server_task).await;
}
