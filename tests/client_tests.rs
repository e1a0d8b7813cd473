//! Client 测试

#[cfg(feature = "client")]
mod config_tests {
    use agent_config_hub::client::ClientConfig;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();

        assert_eq!(config.connect_retries, 3);
        assert_eq!(config.retry_interval_ms, 500);
        assert_eq!(config.registration_timeout, Duration::from_secs(10));
        assert!(config.socket_path.to_str().unwrap().contains(".config-hub"));
    }

    #[test]
    fn test_client_config_new() {
        let config = ClientConfig::new("/tmp/hub/config-hub.sock")
            .with_registration_timeout(Duration::from_millis(250));

        assert_eq!(config.socket_path, PathBuf::from("/tmp/hub/config-hub.sock"));
        assert_eq!(config.registration_timeout, Duration::from_millis(250));
        assert_eq!(config.connect_retries, 3);
    }

    #[tokio::test]
    async fn test_connect_fails_without_server() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = ClientConfig::new(tmp.path().join("missing.sock"));
        config.connect_retries = 2;
        config.retry_interval_ms = 10;

        assert!(agent_config_hub::AgentClient::connect(config).await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_connection_reports_transport_closed() {
        use agent_config_hub::{AgentClient, Error};
        use tokio::io::{AsyncBufReadExt, BufReader};
        use tokio::net::UnixListener;

        let tmp = tempfile::tempdir().unwrap();
        let socket_path = tmp.path().join("hub.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        // 读完一条请求后直接断开
        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut line = String::new();
            BufReader::new(stream).read_line(&mut line).await.unwrap();
        });

        let mut client = AgentClient::connect(ClientConfig::new(socket_path.clone()))
            .await
            .unwrap();
        let err = client.heartbeat().await.unwrap_err();
        peer.await.unwrap();

        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::TransportClosed)));
        assert_eq!(client.close_reason(), None);
    }
}

#[cfg(all(feature = "client", feature = "server"))]
mod session_tests {
    use agent_config_hub::client::{AgentClient, ClientConfig};
    use agent_config_hub::hub::{ConfigServer, ServerConfig};
    use agent_config_hub::protocol::{Open, QueryType};
    use agent_config_hub::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::sleep;

    async fn start_server() -> (Arc<ConfigServer>, TempDir) {
        let tmp = TempDir::new().unwrap();
        let server = Arc::new(ConfigServer::new(ServerConfig::with_data_dir(tmp.path())).unwrap());

        let runner = server.clone();
        tokio::spawn(async move {
            runner.run().await.unwrap();
        });

        let socket_path = server.config().socket_path();
        for _ in 0..50 {
            if socket_path.exists() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        (server, tmp)
    }

    fn client_config(server: &ConfigServer) -> ClientConfig {
        let mut config = ClientConfig::new(server.config().socket_path());
        config.retry_interval_ms = 50;
        config
    }

    #[tokio::test]
    async fn test_runner_open_and_follow_updates() {
        let (server, _tmp) = start_server().await;
        let mut client = AgentClient::connect(client_config(&server)).await.unwrap();

        let initial = client.open(Open::runner().with_identity("r1")).await.unwrap();
        assert_eq!(initial.entity, EntityRef::Runner("r1".to_string()));
        assert_eq!(initial.version, 1);

        // 心跳期间到达的快照不会丢失
        server
            .store()
            .set_config_var(ConfigVar {
                scope: ConfigScope::Runner { id: None },
                name: "REGION".to_string(),
                value: "eu".to_string(),
            })
            .unwrap();
        client.heartbeat().await.unwrap();

        let update = tokio::time::timeout(Duration::from_secs(2), client.next_snapshot())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(update.version, 2);
        match update.payload {
            ConfigPayload::Runner(config) => assert_eq!(config.config_vars["REGION"], "eu"),
            _ => panic!("Expected runner payload"),
        }

        let status = client.query(QueryType::Status).await.unwrap();
        assert_eq!(status["runners"], 1);

        client.close().await.unwrap();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_open_error_surfaces() {
        let (server, _tmp) = start_server().await;
        let mut client = AgentClient::connect(client_config(&server)).await.unwrap();

        let err = client.open(Open::entrypoint("missing")).await.unwrap_err();
        assert!(err.to_string().contains("404"));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_superseded_client_sees_close_reason() {
        let (server, _tmp) = start_server().await;

        let mut first = AgentClient::connect(client_config(&server)).await.unwrap();
        first.open(Open::runner().with_identity("r1")).await.unwrap();

        let mut second = AgentClient::connect(client_config(&server)).await.unwrap();
        second.open(Open::runner().with_identity("r1")).await.unwrap();

        let next = tokio::time::timeout(Duration::from_secs(2), first.next_snapshot())
            .await
            .unwrap()
            .unwrap();
        assert!(next.is_none());
        assert_eq!(first.close_reason(), Some(CloseReason::Superseded));

        server.shutdown();
    }
}
