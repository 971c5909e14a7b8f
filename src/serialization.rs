use core::fmt;
use core::marker::PhantomData;

use serde::de::{self, Deserialize, Deserializer, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeSeq, Serializer};

use crate::allocator::Allocator;
use crate::element::Element;
use crate::CowBuffer;

impl<T: Serialize, A: Allocator> Serialize for CowBuffer<T, A> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.len()))?;
        for item in self.iter() {
            seq.serialize_element(item)?;
        }
        seq.end()
    }
}

struct CowBufferVisitor<T, A> {
    _marker: PhantomData<(T, A)>,
}

impl<'de, T, A> Visitor<'de> for CowBufferVisitor<T, A>
where
    T: Element + Deserialize<'de>,
    A: Allocator + Default,
{
    type Value = CowBuffer<T, A>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a sequence")
    }

    fn visit_seq<S: SeqAccess<'de>>(self, mut seq: S) -> Result<Self::Value, S::Error> {
        let mut buffer = CowBuffer::new_in(A::default());
        while let Some(item) = seq.next_element()? {
            buffer.push(item).map_err(de::Error::custom)?;
        }

        Ok(buffer)
    }
}

impl<'de, T, A> Deserialize<'de> for CowBuffer<T, A>
where
    T: Element + Deserialize<'de>,
    A: Allocator + Default,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_seq(CowBufferVisitor {
            _marker: PhantomData,
        })
    }
}

#[test]
fn json_round_trip() {
    let mut v: CowBuffer<String> = CowBuffer::new();
    v.push("a".to_string()).unwrap();
    v.push("b".to_string()).unwrap();

    let json = serde_json::to_string(&v).unwrap();
    assert_eq!(json, r#"["a","b"]"#);

    let w: CowBuffer<String> = serde_json::from_str(&json).unwrap();
    assert_eq!(v, w);
    assert!(w.is_unique());

    let empty: CowBuffer<u32> = serde_json::from_str("[]").unwrap();
    assert!(empty.is_empty());
    assert!(serde_json::from_str::<CowBuffer<u32>>("{}").is_err());
}
