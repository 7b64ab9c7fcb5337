mod mock_gateway;
mod scenarios;
