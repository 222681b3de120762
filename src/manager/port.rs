use super::ManagerError;
use tokio::net::TcpListener;

/// 端口必须落在 1..=65535
pub fn validate_port(port: i32) -> Result<u16, ManagerError> {
    match u16::try_from(port) {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(ManagerError::InvalidPort(port)),
    }
}

/// 尝试绑定 0.0.0.0:port 判断端口是否空闲
pub async fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_port() {
        assert_eq!(validate_port(1).unwrap(), 1);
        assert_eq!(validate_port(65535).unwrap(), 65535);
        assert!(validate_port(0).is_err());
        assert!(validate_port(-80).is_err());
        assert!(validate_port(65536).is_err());
    }

    #[tokio::test]
    async fn test_port_availability() {
        let listener = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_available(port).await);

        drop(listener);
        assert!(is_port_available(port).await);
    }
}
