/// Frame header preceding every request and response body.
///
/// Sequence numbers are assigned by the client, starting at 1. A sequence
/// number of 0 is reserved and never assigned to a call.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
pub struct Header {
    /// Target in `"Service.Method"` form.
    pub service_method: String,
    #[cfg_attr(test, strategy(1u64..=u64::MAX))]
    pub seq: u64,
    /// Empty on success. On a response, any other value is the error text of
    /// the failed call.
    pub error: String,
}

impl Header {
    pub fn request(service_method: impl ToString, seq: u64) -> Self {
        Self {
            service_method: service_method.to_string(),
            seq,
            error: String::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }

    /// Splits `"Service.Method"` into its two parts.
    pub fn split_service_method(&self) -> Result<(&str, &str), InvalidServiceMethod> {
        let mut parts = self.service_method.splitn(2, '.');
        match (parts.next(), parts.next()) {
            (Some(service), Some(method)) if !service.is_empty() && !method.is_empty() => {
                Ok((service, method))
            }
            _ => Err(InvalidServiceMethod {
                value: self.service_method.clone(),
            }),
        }
    }
}

/// Error returned from [Header::split_service_method].
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("service/method request ill-formed: {value:?}")]
pub struct InvalidServiceMethod {
    pub value: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn split_service_method() {
        let header = Header::request("Arith.Add", 1);
        assert_eq!(header.split_service_method().unwrap(), ("Arith", "Add"));
    }

    #[test]
    fn split_service_method_keeps_extra_dots() {
        let header = Header::request("Arith.Add.Extra", 1);
        assert_eq!(
            header.split_service_method().unwrap(),
            ("Arith", "Add.Extra")
        );
    }

    #[test]
    fn split_service_method_ill_formed() {
        for value in &["", "Arith", "Arith.", ".Add", "."] {
            let header = Header::request(value, 1);
            let err = header.split_service_method().unwrap_err();
            assert_eq!(err.value, value.to_string());
        }
    }
}
