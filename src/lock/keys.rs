//! Lock key names. The manager prepends its own prefix.

use crate::core_types::{GoodsId, RoomId, UserId};

pub fn create_order_user(user_id: UserId) -> String {
    format!("create_order:user:{user_id}")
}

pub fn goods_stock(goods_id: GoodsId) -> String {
    format!("goods_stock:{goods_id}")
}

pub fn payment(order_no: &str) -> String {
    format!("payment:{order_no}")
}

pub fn cancel_order(order_no: &str) -> String {
    format!("cancel_order:{order_no}")
}

pub fn order_status_update(order_no: &str) -> String {
    format!("order_status_update:{order_no}")
}

pub fn room_booking(room_id: RoomId) -> String {
    format!("room_booking:{room_id}")
}

pub fn booking(booking_no: &str) -> String {
    format!("booking:{booking_no}")
}

pub fn compensation_sweep() -> String {
    "compensation:sweep".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_names() {
        assert_eq!(create_order_user(7), "create_order:user:7");
        assert_eq!(goods_stock(3), "goods_stock:3");
        assert_eq!(cancel_order("ORD1"), "cancel_order:ORD1");
        assert_eq!(order_status_update("ORD1"), "order_status_update:ORD1");
        assert_eq!(room_booking(12), "room_booking:12");
    }
}
