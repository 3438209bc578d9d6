// ===============================
// src/adapter.rs
// ===============================
//
// Venue adapter contract. The drivers never touch wire formats: every venue
// specific decision goes through one of these hooks. Routing predicates
// default to `false`, converters and request builders to `Unimplemented`,
// pagination to "no next page".

use serde_json::Value;
use tracing::warn;

use crate::config::EngineConfig;
use crate::domain::{
    Balance, Bbo, Fill, InstrumentInformation, Ohlcv, Order, Position, TimePoint, Trade,
};
use crate::envelope::{
    ConnectionRole, RequestBuilder, RestRequest, RestResponse, WebsocketMessage, WebsocketRequest,
    WebsocketRequestKind,
};
use crate::error::AdapterError;

type Converted<T> = Result<T, AdapterError>;

#[allow(unused_variables)]
pub trait VenueAdapter: Send + Sync + 'static {
    fn name(&self) -> &str;

    // ---------------------------------------------------------------
    // REST request builders
    // ---------------------------------------------------------------

    fn rest_fetch_instrument_information_request(&self, cfg: &EngineConfig) -> Converted<RequestBuilder> {
        Err(AdapterError::Unimplemented("rest_fetch_instrument_information_request"))
    }

    fn rest_fetch_bbo_request(&self, cfg: &EngineConfig, symbols: &[String]) -> Converted<RequestBuilder> {
        Err(AdapterError::Unimplemented("rest_fetch_bbo_request"))
    }

    fn rest_fetch_historical_trade_request(&self, cfg: &EngineConfig, symbol: &str) -> Converted<RequestBuilder> {
        Err(AdapterError::Unimplemented("rest_fetch_historical_trade_request"))
    }

    fn rest_fetch_historical_ohlcv_request(&self, cfg: &EngineConfig, symbol: &str) -> Converted<RequestBuilder> {
        Err(AdapterError::Unimplemented("rest_fetch_historical_ohlcv_request"))
    }

    fn rest_create_order_request(&self, cfg: &EngineConfig, order: &Order) -> Converted<RequestBuilder> {
        Err(AdapterError::Unimplemented("rest_create_order_request"))
    }

    fn rest_cancel_order_request(&self, cfg: &EngineConfig, order: &Order) -> Converted<RequestBuilder> {
        Err(AdapterError::Unimplemented("rest_cancel_order_request"))
    }

    fn rest_fetch_order_request(&self, cfg: &EngineConfig, order: &Order) -> Converted<RequestBuilder> {
        Err(AdapterError::Unimplemented("rest_fetch_order_request"))
    }

    fn rest_fetch_open_orders_request(&self, cfg: &EngineConfig, symbol: Option<&str>) -> Converted<RequestBuilder> {
        Err(AdapterError::Unimplemented("rest_fetch_open_orders_request"))
    }

    fn rest_fetch_position_request(&self, cfg: &EngineConfig) -> Converted<RequestBuilder> {
        Err(AdapterError::Unimplemented("rest_fetch_position_request"))
    }

    fn rest_fetch_balance_request(&self, cfg: &EngineConfig) -> Converted<RequestBuilder> {
        Err(AdapterError::Unimplemented("rest_fetch_balance_request"))
    }

    fn rest_fetch_historical_order_request(&self, cfg: &EngineConfig, symbol: &str) -> Converted<RequestBuilder> {
        Err(AdapterError::Unimplemented("rest_fetch_historical_order_request"))
    }

    fn rest_fetch_historical_fill_request(&self, cfg: &EngineConfig, symbol: &str) -> Converted<RequestBuilder> {
        Err(AdapterError::Unimplemented("rest_fetch_historical_fill_request"))
    }

    // ---------------------------------------------------------------
    // REST response routing
    // ---------------------------------------------------------------

    fn is_rest_response_success(&self, response: &RestResponse) -> bool {
        (200..300).contains(&response.status)
    }

    fn is_rest_response_for_instrument_information(&self, response: &RestResponse) -> bool {
        false
    }
    fn is_rest_response_for_bbo(&self, response: &RestResponse) -> bool {
        false
    }
    fn is_rest_response_for_historical_trade(&self, response: &RestResponse) -> bool {
        false
    }
    fn is_rest_response_for_historical_ohlcv(&self, response: &RestResponse) -> bool {
        false
    }
    fn is_rest_response_for_create_order(&self, response: &RestResponse) -> bool {
        false
    }
    fn is_rest_response_for_cancel_order(&self, response: &RestResponse) -> bool {
        false
    }
    fn is_rest_response_for_fetch_order(&self, response: &RestResponse) -> bool {
        false
    }
    fn is_rest_response_for_fetch_open_orders(&self, response: &RestResponse) -> bool {
        false
    }
    fn is_rest_response_for_position(&self, response: &RestResponse) -> bool {
        false
    }
    fn is_rest_response_for_balance(&self, response: &RestResponse) -> bool {
        false
    }
    fn is_rest_response_for_historical_order(&self, response: &RestResponse) -> bool {
        false
    }
    fn is_rest_response_for_historical_fill(&self, response: &RestResponse) -> bool {
        false
    }

    // ---------------------------------------------------------------
    // REST converters
    // ---------------------------------------------------------------

    fn convert_rest_response_for_instrument_information(
        &self,
        payload: &Value,
        request: &RestRequest,
    ) -> Converted<Vec<InstrumentInformation>> {
        Err(AdapterError::Unimplemented("convert_rest_response_for_instrument_information"))
    }

    fn convert_rest_response_for_bbo(&self, payload: &Value, request: &RestRequest) -> Converted<Vec<Bbo>> {
        Err(AdapterError::Unimplemented("convert_rest_response_for_bbo"))
    }

    fn convert_rest_response_for_historical_trade(
        &self,
        payload: &Value,
        request: &RestRequest,
    ) -> Converted<Vec<Trade>> {
        Err(AdapterError::Unimplemented("convert_rest_response_for_historical_trade"))
    }

    fn convert_rest_response_for_historical_ohlcv(
        &self,
        payload: &Value,
        request: &RestRequest,
    ) -> Converted<Vec<Ohlcv>> {
        Err(AdapterError::Unimplemented("convert_rest_response_for_historical_ohlcv"))
    }

    fn convert_rest_response_for_create_order(&self, payload: &Value, request: &RestRequest) -> Converted<Order> {
        Err(AdapterError::Unimplemented("convert_rest_response_for_create_order"))
    }

    fn convert_rest_response_for_cancel_order(&self, payload: &Value, request: &RestRequest) -> Converted<Order> {
        Err(AdapterError::Unimplemented("convert_rest_response_for_cancel_order"))
    }

    fn convert_rest_response_for_fetch_order(&self, payload: &Value, request: &RestRequest) -> Converted<Order> {
        Err(AdapterError::Unimplemented("convert_rest_response_for_fetch_order"))
    }

    fn convert_rest_response_for_fetch_open_orders(
        &self,
        payload: &Value,
        request: &RestRequest,
    ) -> Converted<Vec<Order>> {
        Err(AdapterError::Unimplemented("convert_rest_response_for_fetch_open_orders"))
    }

    fn convert_rest_response_for_position(&self, payload: &Value, request: &RestRequest) -> Converted<Vec<Position>> {
        Err(AdapterError::Unimplemented("convert_rest_response_for_position"))
    }

    fn convert_rest_response_for_balance(&self, payload: &Value, request: &RestRequest) -> Converted<Vec<Balance>> {
        Err(AdapterError::Unimplemented("convert_rest_response_for_balance"))
    }

    fn convert_rest_response_for_historical_order(
        &self,
        payload: &Value,
        request: &RestRequest,
    ) -> Converted<Vec<Order>> {
        Err(AdapterError::Unimplemented("convert_rest_response_for_historical_order"))
    }

    fn convert_rest_response_for_historical_fill(
        &self,
        payload: &Value,
        request: &RestRequest,
    ) -> Converted<Vec<Fill>> {
        Err(AdapterError::Unimplemented("convert_rest_response_for_historical_fill"))
    }

    // ---------------------------------------------------------------
    // REST pagination
    // ---------------------------------------------------------------

    fn next_rest_request_for_historical_trade(
        &self,
        cfg: &EngineConfig,
        payload: &Value,
        request: &RestRequest,
    ) -> Converted<Option<RequestBuilder>> {
        Ok(None)
    }

    fn next_rest_request_for_historical_ohlcv(
        &self,
        cfg: &EngineConfig,
        payload: &Value,
        request: &RestRequest,
    ) -> Converted<Option<RequestBuilder>> {
        Ok(None)
    }

    fn next_rest_request_for_fetch_open_orders(
        &self,
        cfg: &EngineConfig,
        payload: &Value,
        request: &RestRequest,
    ) -> Converted<Option<RequestBuilder>> {
        Ok(None)
    }

    fn next_rest_request_for_historical_order(
        &self,
        cfg: &EngineConfig,
        payload: &Value,
        request: &RestRequest,
    ) -> Converted<Option<RequestBuilder>> {
        Ok(None)
    }

    fn next_rest_request_for_historical_fill(
        &self,
        cfg: &EngineConfig,
        payload: &Value,
        request: &RestRequest,
    ) -> Converted<Option<RequestBuilder>> {
        Ok(None)
    }

    /// Orders to reconcile for a failed REST response (e.g. a rejected create).
    fn handle_rest_response_error(&self, response: &RestResponse) -> Vec<Order> {
        warn!(
            venue = %self.name(),
            status = response.status,
            method = %response.request.method.as_str(),
            path = %response.request.path,
            body = %response.body,
            "rest response error"
        );
        Vec::new()
    }

    // ---------------------------------------------------------------
    // WebSocket endpoints & requests
    // ---------------------------------------------------------------

    /// `None`: the venue has no connection for this role.
    fn websocket_url(&self, cfg: &EngineConfig, role: ConnectionRole) -> Option<String> {
        None
    }

    fn websocket_market_data_subscribe_request(
        &self,
        cfg: &EngineConfig,
        symbols: &[String],
        id: String,
    ) -> Converted<WebsocketRequest> {
        Err(AdapterError::Unimplemented("websocket_market_data_subscribe_request"))
    }

    /// `Ok(None)`: no login needed, the connection counts as logged in on connect.
    fn websocket_login_request(
        &self,
        cfg: &EngineConfig,
        role: ConnectionRole,
        id: String,
        now: TimePoint,
    ) -> Converted<Option<WebsocketRequest>> {
        Ok(None)
    }

    fn websocket_account_subscribe_request(
        &self,
        cfg: &EngineConfig,
        id: String,
        now: TimePoint,
    ) -> Converted<Option<WebsocketRequest>> {
        Ok(None)
    }

    /// Application-level heartbeat; `None` when the venue has none for this role.
    fn websocket_ping_request(&self, role: ConnectionRole, id: String) -> Option<WebsocketRequest> {
        None
    }

    fn websocket_create_order_request(
        &self,
        cfg: &EngineConfig,
        order: &Order,
        id: String,
        now: TimePoint,
    ) -> Converted<WebsocketRequest> {
        Err(AdapterError::Unimplemented("websocket_create_order_request"))
    }

    fn websocket_cancel_order_request(
        &self,
        cfg: &EngineConfig,
        order: &Order,
        id: String,
        now: TimePoint,
    ) -> Converted<WebsocketRequest> {
        Err(AdapterError::Unimplemented("websocket_cancel_order_request"))
    }

    // ---------------------------------------------------------------
    // WebSocket demultiplexing
    // ---------------------------------------------------------------

    /// Correlation id of a response; `None` marks a push.
    fn extract_websocket_request_id(&self, message: &WebsocketMessage) -> Option<String> {
        None
    }

    fn is_websocket_response_success(&self, message: &WebsocketMessage) -> bool {
        true
    }

    fn is_websocket_push_for_bbo(&self, message: &WebsocketMessage) -> bool {
        false
    }
    fn is_websocket_push_for_trade(&self, message: &WebsocketMessage) -> bool {
        false
    }
    fn is_websocket_push_for_ohlcv(&self, message: &WebsocketMessage) -> bool {
        false
    }
    fn is_websocket_push_for_order(&self, message: &WebsocketMessage) -> bool {
        false
    }
    fn is_websocket_push_for_fill(&self, message: &WebsocketMessage) -> bool {
        false
    }
    fn is_websocket_push_for_position(&self, message: &WebsocketMessage) -> bool {
        false
    }
    fn is_websocket_push_for_balance(&self, message: &WebsocketMessage) -> bool {
        false
    }

    // Response predicates fall back to the kind of the matched request.
    fn is_websocket_response_for_create_order(&self, message: &WebsocketMessage) -> bool {
        message.request_kind() == Some(WebsocketRequestKind::CreateOrder)
    }
    fn is_websocket_response_for_cancel_order(&self, message: &WebsocketMessage) -> bool {
        message.request_kind() == Some(WebsocketRequestKind::CancelOrder)
    }
    fn is_websocket_response_for_subscribe(&self, message: &WebsocketMessage) -> bool {
        message.request_kind() == Some(WebsocketRequestKind::Subscribe)
    }
    fn is_websocket_response_for_login(&self, message: &WebsocketMessage) -> bool {
        message.request_kind() == Some(WebsocketRequestKind::Login)
    }

    fn convert_websocket_push_for_bbo(&self, payload: &Value) -> Converted<Vec<Bbo>> {
        Err(AdapterError::Unimplemented("convert_websocket_push_for_bbo"))
    }
    fn convert_websocket_push_for_trade(&self, payload: &Value) -> Converted<Vec<Trade>> {
        Err(AdapterError::Unimplemented("convert_websocket_push_for_trade"))
    }
    fn convert_websocket_push_for_ohlcv(&self, payload: &Value) -> Converted<Vec<Ohlcv>> {
        Err(AdapterError::Unimplemented("convert_websocket_push_for_ohlcv"))
    }
    fn convert_websocket_push_for_order(&self, payload: &Value) -> Converted<Vec<Order>> {
        Err(AdapterError::Unimplemented("convert_websocket_push_for_order"))
    }
    fn convert_websocket_push_for_fill(&self, payload: &Value) -> Converted<Vec<Fill>> {
        Err(AdapterError::Unimplemented("convert_websocket_push_for_fill"))
    }
    fn convert_websocket_push_for_position(&self, payload: &Value) -> Converted<Vec<Position>> {
        Err(AdapterError::Unimplemented("convert_websocket_push_for_position"))
    }
    fn convert_websocket_push_for_balance(&self, payload: &Value) -> Converted<Vec<Balance>> {
        Err(AdapterError::Unimplemented("convert_websocket_push_for_balance"))
    }

    fn convert_websocket_response_for_create_order(
        &self,
        payload: &Value,
        request: Option<&WebsocketRequest>,
    ) -> Converted<Order> {
        Err(AdapterError::Unimplemented("convert_websocket_response_for_create_order"))
    }

    fn convert_websocket_response_for_cancel_order(
        &self,
        payload: &Value,
        request: Option<&WebsocketRequest>,
    ) -> Converted<Order> {
        Err(AdapterError::Unimplemented("convert_websocket_response_for_cancel_order"))
    }

    fn handle_websocket_response_error(&self, message: &WebsocketMessage) -> Vec<Order> {
        warn!(
            venue = %self.name(),
            role = %message.role.as_str(),
            request_id = ?message.request_id,
            payload = %message.payload,
            "websocket response error"
        );
        Vec::new()
    }
}
