//! Translation of the API's VPN crypto vocabulary (inherited from the
//! vendor appliances) into the IPsec stack's vocabulary.
//!
//! Every lookup is explicit; an unknown input is an error, not a guess. A
//! silently wrong proposal string would negotiate nothing.

/// IKE authentication algorithms.
pub fn ike_authentication(value: &str) -> Option<&'static str> {
    Some(match value {
        "md5" => "md5",
        "sha1" => "sha1",
        "sha-256" => "sha256",
        "sha-384" => "sha384",
        _ => return None,
    })
}

/// IKE Diffie-Hellman groups.
pub fn ike_dh_group(value: &str) -> Option<&'static str> {
    Some(match value {
        "group1" => "modp768",
        "group2" => "modp1024",
        "group5" => "modp1536",
        "group19" => "ecp256",
        "group20" => "ecp384",
        "group24" => "modp2048s256",
        _ => return None,
    })
}

/// IKE encryption algorithms.
pub fn ike_encryption(value: &str) -> Option<&'static str> {
    Some(match value {
        "aes-128-cbc" => "aes128",
        "aes-192-cbc" => "aes192",
        "aes-256-cbc" => "aes256",
        "des-cbc" => "des",
        "3des-cbc" => "3des",
        _ => return None,
    })
}

/// ESP authentication algorithms.
pub fn ipsec_authentication(value: &str) -> Option<&'static str> {
    Some(match value {
        "hmac-md5-96" => "md5",
        "hmac-sha1-96" => "sha1",
        "hmac-sha-256-128" => "sha256",
        _ => return None,
    })
}

/// ESP encryption algorithms.
pub fn ipsec_encryption(value: &str) -> Option<&'static str> {
    Some(match value {
        "aes-128-cbc" => "aes128",
        "aes-192-cbc" => "aes192",
        "aes-256-cbc" => "aes256",
        "des-cbc" => "des",
        "3des-cbc" => "3des",
        "aes-128-gcm" => "aes128gcm64",
        "aes-192-gcm" => "aes192gcm64",
        "aes-256-gcm" => "aes256gcm64",
        _ => return None,
    })
}

/// Perfect-forward-secrecy groups.
pub fn ipsec_pfs_group(value: &str) -> Option<&'static str> {
    Some(match value {
        "group1" => "modp768",
        "group2" => "modp1024",
        "group5" => "modp1536",
        "group14" => "modp2048",
        "group19" => "ecp256",
        "group20" => "ecp384",
        "group24" => "modp2048s256",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_values_translate() {
        assert_eq!(ike_authentication("sha-256"), Some("sha256"));
        assert_eq!(ike_dh_group("group24"), Some("modp2048s256"));
        assert_eq!(ike_encryption("3des-cbc"), Some("3des"));
        assert_eq!(ipsec_authentication("hmac-sha1-96"), Some("sha1"));
        assert_eq!(ipsec_encryption("aes-256-gcm"), Some("aes256gcm64"));
        assert_eq!(ipsec_pfs_group("group14"), Some("modp2048"));
    }

    #[test]
    fn unknown_values_are_errors() {
        assert_eq!(ike_authentication("sha-512"), None);
        assert_eq!(ike_dh_group("group3"), None);
        assert_eq!(ike_encryption("blowfish"), None);
        assert_eq!(ipsec_pfs_group(""), None);
    }
}
