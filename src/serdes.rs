/// Serde yaml represents things differently than just "JSON in YAML format".
/// We don't want this. Instead, we transcode YAML via the JSON module, so the
/// routing document behaves identically whether it arrives as YAML or JSON,
/// and parse errors carry the path to the offending field.
pub mod yamlviajson {
	use serde::{de, ser};

	pub fn from_str<T>(s: &str) -> anyhow::Result<T>
	where
		T: for<'de> de::Deserialize<'de>,
	{
		let de_yaml = serde_yaml::Deserializer::from_str(s);
		let mut buf = Vec::with_capacity(128);
		{
			let mut se_json = serde_json::Serializer::new(&mut buf);
			serde_transcode::transcode(de_yaml, &mut se_json)?;
		} // se_json is dropped here, releasing the mutable borrow on buf
		let mut de_json = serde_json::Deserializer::from_slice(&buf);
		Ok(serde_path_to_error::deserialize(&mut de_json)?)
	}

	pub fn to_string<T>(value: &T) -> anyhow::Result<String>
	where
		T: ?Sized + ser::Serialize,
	{
		let js = serde_json::to_string(value)?;
		let mut buf = Vec::with_capacity(128);
		let mut se_yaml = serde_yaml::Serializer::new(&mut buf);
		let mut de_json = serde_json::Deserializer::from_str(&js);
		serde_transcode::transcode(&mut de_json, &mut se_yaml)?;
		Ok(String::from_utf8(buf)?)
	}
}
