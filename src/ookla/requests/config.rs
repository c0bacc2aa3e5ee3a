use crate::ookla::requests::{Request, ResponseFormat, BASE_URL};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Client identity as speedtest.net sees it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    #[serde(rename(deserialize = "@ip"), default)]
    pub ip: String,
    #[serde(rename(deserialize = "@lat"), default)]
    pub lat: f64,
    #[serde(rename(deserialize = "@lon"), default)]
    pub lon: f64,
    #[serde(rename(deserialize = "@isp"), default)]
    pub isp: String,
    #[serde(rename(deserialize = "@isprating"), default)]
    pub isp_rating: f64,
    #[serde(rename(deserialize = "@ispdlavg"), default)]
    pub isp_download_avg: f64,
    #[serde(rename(deserialize = "@ispulavg"), default)]
    pub isp_upload_avg: f64,
    #[serde(rename(deserialize = "@country"), default)]
    pub country: String,
}

/// The `<settings>` document returned by the config endpoint.
#[derive(Debug, Deserialize)]
pub struct Settings {
    pub client: ClientInfo,
}

pub struct ConfigRequest;

impl Request for ConfigRequest {
    type Response = Settings;

    const FORMAT: ResponseFormat = ResponseFormat::Xml;

    fn url(&self) -> Cow<'_, str> {
        format!("{}/speedtest-config.php", BASE_URL).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_settings_xml() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<settings>
<client ip="203.0.113.7" lat="50.0804" lon="14.4107" isp="Example ISP" isprating="3.7" rating="0" ispdlavg="0" ispulavg="0" loggedin="0" country="CZ" />
<server-config threadcount="4" ignoreids="" notonmap="" forcepingid="" preferredserverid=""/>
<times dl1="5000000" dl2="35000000" dl3="800000000" ul1="1000000" ul2="8400000" ul3="35000000"/>
</settings>"#;

        let settings: Settings = quick_xml::de::from_str(xml).unwrap();
        let client = settings.client;

        assert_eq!(client.ip, "203.0.113.7");
        assert_eq!(client.isp, "Example ISP");
        assert_eq!(client.country, "CZ");
        assert!((client.lat - 50.0804).abs() < 1e-9);
        assert!((client.isp_rating - 3.7).abs() < 1e-9);
    }

    #[test]
    fn test_client_info_serializes_plain_names() {
        let json = serde_json::to_string(&ClientInfo::default()).unwrap();
        assert!(json.contains("\"ip\""));
        assert!(!json.contains('@'));
    }
}
