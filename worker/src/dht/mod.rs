//! Kademlia風DHT
//!
//! Coordinator不在時のサービス発見フォールバック。256ビットID空間の
//! XOR距離でピアを整列し、kバケットのルーティングテーブルを保持する。
//! トランスポートはワーカーピアAPI上のHTTP。

pub mod node;

pub use node::DhtNode;

use fleet_common::protocol::PeerInfo;
use sha2::{Digest, Sha256};

/// kバケットあたりの最大ピア数
pub const BUCKET_SIZE: usize = 16;

/// 検索の並列度（α）
pub const ALPHA: usize = 3;

/// 256ビットノードID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    /// hex表現からパースする
    pub fn from_hex(hex_str: &str) -> Option<Self> {
        let bytes = hex::decode(hex_str).ok()?;
        let array: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    /// サービス名などの任意キーからIDを導出する
    pub fn from_key(key: &str) -> Self {
        Self(Sha256::digest(key.as_bytes()).into())
    }

    /// hex表現を返す
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// XOR距離
    pub fn distance(&self, other: &NodeId) -> [u8; 32] {
        let mut result = [0u8; 32];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        result
    }

    /// 距離の先頭ゼロビット数からバケットインデックスを決める
    ///
    /// 距離が0（自分自身）のときはNone。
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        let distance = self.distance(other);
        for (i, byte) in distance.iter().enumerate() {
            if *byte != 0 {
                let leading = i * 8 + byte.leading_zeros() as usize;
                return Some(255 - leading);
            }
        }
        None
    }
}

/// kバケット制のルーティングテーブル
#[derive(Debug)]
pub struct RoutingTable {
    own_id: NodeId,
    buckets: Vec<Vec<PeerInfo>>,
}

impl RoutingTable {
    /// 自ノードIDを指定してテーブルを作成
    pub fn new(own_id: NodeId) -> Self {
        Self {
            own_id,
            buckets: vec![Vec::new(); 256],
        }
    }

    /// ピアを追加する
    ///
    /// 既知のピアはアドレスを更新して末尾へ移す。バケットが満杯なら
    /// 新規ピアは黙って捨てる（既存ピア優先の単純な方針）。
    pub fn insert(&mut self, peer: PeerInfo) {
        let Some(peer_id) = NodeId::from_hex(&peer.peer_id) else {
            return;
        };
        let Some(index) = self.own_id.bucket_index(&peer_id) else {
            // 自分自身は格納しない
            return;
        };

        let bucket = &mut self.buckets[index];
        if let Some(pos) = bucket.iter().position(|p| p.peer_id == peer.peer_id) {
            bucket.remove(pos);
            bucket.push(peer);
            return;
        }
        if bucket.len() < BUCKET_SIZE {
            bucket.push(peer);
        }
    }

    /// ピアを削除する（到達不能になったとき）
    pub fn remove(&mut self, peer_id: &str) {
        let Some(id) = NodeId::from_hex(peer_id) else {
            return;
        };
        if let Some(index) = self.own_id.bucket_index(&id) {
            self.buckets[index].retain(|p| p.peer_id != peer_id);
        }
    }

    /// 対象IDにXOR距離で最も近い既知ピアを最大`count`件返す
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<PeerInfo> {
        let mut peers: Vec<&PeerInfo> = self.buckets.iter().flatten().collect();
        peers.sort_by_key(|peer| {
            NodeId::from_hex(&peer.peer_id)
                .map(|id| id.distance(target))
                .unwrap_or([0xff; 32])
        });
        peers.into_iter().take(count).cloned().collect()
    }

    /// 既知ピアの総数
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    /// ピアをひとつも知らないか
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: NodeId, port: u16) -> PeerInfo {
        PeerInfo {
            peer_id: id.to_hex(),
            address: format!("127.0.0.1:{}", port).parse().unwrap(),
        }
    }

    fn id_with_first_byte(byte: u8) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[0] = byte;
        NodeId(bytes)
    }

    #[test]
    fn test_distance_is_symmetric_and_zero_for_self() {
        let a = NodeId::from_key("a");
        let b = NodeId::from_key("b");

        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a), [0u8; 32]);
    }

    #[test]
    fn test_bucket_index_by_leading_zeros() {
        let own = NodeId([0u8; 32]);

        // 先頭ビットが異なる→最遠バケット
        assert_eq!(own.bucket_index(&id_with_first_byte(0x80)), Some(255));
        assert_eq!(own.bucket_index(&id_with_first_byte(0x01)), Some(248));
        assert_eq!(own.bucket_index(&own), None);
    }

    #[test]
    fn test_insert_ignores_self_and_updates_known_peer() {
        let own = NodeId::from_key("self");
        let mut table = RoutingTable::new(own);

        table.insert(peer(own, 7171));
        assert!(table.is_empty());

        let other = NodeId::from_key("other");
        table.insert(peer(other, 7171));
        table.insert(peer(other, 7272));

        assert_eq!(table.len(), 1);
        let found = table.closest(&other, 1);
        assert_eq!(found[0].address.port(), 7272);
    }

    #[test]
    fn test_full_bucket_drops_newcomer() {
        let own = NodeId([0u8; 32]);
        let mut table = RoutingTable::new(own);

        // すべて同じバケット（先頭バイト0x80台）に入るIDを生成
        for i in 0..(BUCKET_SIZE + 4) {
            let mut bytes = [0u8; 32];
            bytes[0] = 0x80;
            bytes[31] = i as u8 + 1;
            table.insert(peer(NodeId(bytes), 7171));
        }

        assert_eq!(table.len(), BUCKET_SIZE);
    }

    #[test]
    fn test_closest_orders_by_xor_distance() {
        let own = NodeId::from_key("self");
        let mut table = RoutingTable::new(own);

        let target = NodeId([0u8; 32]);
        let near = id_with_first_byte(0x01);
        let far = id_with_first_byte(0xf0);

        table.insert(peer(far, 7001));
        table.insert(peer(near, 7002));

        let closest = table.closest(&target, 2);
        assert_eq!(closest[0].peer_id, near.to_hex());
        assert_eq!(closest[1].peer_id, far.to_hex());
    }
}
